//! Conversion of provider usage into money.
//!
//! Amounts use [`Decimal`] so that per-million token rates add up exactly.

use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TokenUsage;

const TOKENS_PER_RATE_UNIT: u64 = 1_000_000;

/// Pricing configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    /// Currency code is blank.
    #[error("pricing currency must not be empty")]
    MissingCurrency,
    /// A field required by the pricing mode is absent.
    #[error("{mode} pricing requires {field}")]
    MissingField {
        /// Pricing mode.
        mode: &'static str,
        /// Missing field name.
        field: &'static str,
    },
    /// An amount is negative.
    #[error("{0} must not be negative")]
    Negative(&'static str),
}

/// How usage is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    /// Per million input and output tokens.
    Token,
    /// Per page processed.
    Page,
    /// Flat amount per run.
    Fixed,
    /// Free.
    #[default]
    None,
}

impl PricingMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Page => "page",
            Self::Fixed => "fixed",
            Self::None => "none",
        }
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Pricing of one extractor or model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PricingConfig {
    /// Pricing mode.
    #[serde(default)]
    pub mode: PricingMode,
    /// ISO currency code, carried through unchanged.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Price per million input tokens.
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub input_price_per_million: Option<Decimal>,
    /// Price per million output tokens.
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub output_price_per_million: Option<Decimal>,
    /// Price per page.
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub price_per_page: Option<Decimal>,
    /// Flat price per run.
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub fixed_cost: Option<Decimal>,
    /// Floor applied to any non-zero-mode cost.
    #[serde(default)]
    #[schemars(with = "Option<f64>")]
    pub minimum_charge: Option<Decimal>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            mode: PricingMode::None,
            currency: default_currency(),
            input_price_per_million: None,
            output_price_per_million: None,
            price_per_page: None,
            fixed_cost: None,
            minimum_charge: None,
        }
    }
}

/// Usage counters priced by [`PricingConfig::compute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMetrics {
    /// Input tokens.
    pub input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Pages processed.
    pub pages: u32,
}

impl UsageMetrics {
    /// Token-only usage.
    #[must_use]
    pub const fn from_tokens(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            pages: 0,
        }
    }

    /// Adds a page count.
    #[must_use]
    pub const fn with_pages(mut self, pages: u32) -> Self {
        self.pages = pages;
        self
    }
}

impl PricingConfig {
    /// Token pricing with per-million rates.
    #[must_use]
    pub fn token(currency: &str, input: Decimal, output: Decimal) -> Self {
        Self {
            mode: PricingMode::Token,
            currency: currency.to_string(),
            input_price_per_million: Some(input),
            output_price_per_million: Some(output),
            ..Self::default()
        }
    }

    /// Per-page pricing.
    #[must_use]
    pub fn page(currency: &str, per_page: Decimal) -> Self {
        Self {
            mode: PricingMode::Page,
            currency: currency.to_string(),
            price_per_page: Some(per_page),
            ..Self::default()
        }
    }

    /// Flat pricing.
    #[must_use]
    pub fn fixed(currency: &str, amount: Decimal) -> Self {
        Self {
            mode: PricingMode::Fixed,
            currency: currency.to_string(),
            fixed_cost: Some(amount),
            ..Self::default()
        }
    }

    /// Sets the minimum charge.
    #[must_use]
    pub const fn with_minimum_charge(mut self, minimum: Decimal) -> Self {
        self.minimum_charge = Some(minimum);
        self
    }

    /// Checks that every field the mode needs is present and non-negative.
    pub fn validate(&self) -> Result<(), PricingError> {
        if self.currency.trim().is_empty() {
            return Err(PricingError::MissingCurrency);
        }
        let mode = self.mode.as_str();
        let required: Vec<(&'static str, Option<Decimal>)> = match self.mode {
            PricingMode::Token => vec![
                ("inputPricePerMillion", self.input_price_per_million),
                ("outputPricePerMillion", self.output_price_per_million),
            ],
            PricingMode::Page => vec![("pricePerPage", self.price_per_page)],
            PricingMode::Fixed => vec![("fixedCost", self.fixed_cost)],
            PricingMode::None => Vec::new(),
        };
        for (field, value) in required {
            match value {
                None => return Err(PricingError::MissingField { mode, field }),
                Some(v) if v.is_sign_negative() && !v.is_zero() => {
                    return Err(PricingError::Negative(field));
                }
                Some(_) => {}
            }
        }
        if self.minimum_charge.is_some_and(|m| m.is_sign_negative() && !m.is_zero()) {
            return Err(PricingError::Negative("minimumCharge"));
        }
        Ok(())
    }

    /// Prices the given usage. Missing rates count as zero.
    #[must_use]
    pub fn compute(&self, usage: UsageMetrics) -> Decimal {
        let per_million = Decimal::from(TOKENS_PER_RATE_UNIT);
        let cost = match self.mode {
            PricingMode::None => return Decimal::ZERO,
            PricingMode::Token => {
                let input = Decimal::from(usage.input_tokens) / per_million
                    * self.input_price_per_million.unwrap_or_default();
                let output = Decimal::from(usage.output_tokens) / per_million
                    * self.output_price_per_million.unwrap_or_default();
                input + output
            }
            PricingMode::Page => {
                Decimal::from(usage.pages) * self.price_per_page.unwrap_or_default()
            }
            PricingMode::Fixed => self.fixed_cost.unwrap_or_default(),
        };
        match self.minimum_charge {
            Some(minimum) if minimum > Decimal::ZERO && cost < minimum => minimum,
            _ => cost,
        }
    }
}

/// One priced component of a run.
#[derive(Debug, Clone, Copy)]
pub struct CostComponent<'a> {
    /// Pricing, if the component is priced at all.
    pub pricing: Option<&'a PricingConfig>,
    /// Usage to price.
    pub usage: UsageMetrics,
}

/// Costs of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostSummary {
    /// Text acquisition cost.
    pub text_cost: Decimal,
    /// LLM cost.
    pub llm_cost: Decimal,
    /// Sum of both, or `None` when the currencies differ.
    pub total: Option<Decimal>,
    /// Currency of the amounts.
    pub currency: Option<String>,
}

/// Prices text acquisition and LLM usage and combines them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostAccountant;

impl CostAccountant {
    /// Computes both components and the total.
    ///
    /// Currencies are never converted. When two non-zero components are
    /// priced in different currencies the total is left undefined.
    ///
    /// # Examples
    ///
    /// ```
    /// use docflow_engine::cost::{CostAccountant, CostComponent, PricingConfig, UsageMetrics};
    /// use rust_decimal::Decimal;
    ///
    /// let llm = PricingConfig::token("USD", Decimal::from(2), Decimal::from(4));
    /// let summary = CostAccountant.summarize(
    ///     CostComponent { pricing: None, usage: UsageMetrics::default() },
    ///     CostComponent {
    ///         pricing: Some(&llm),
    ///         usage: UsageMetrics { input_tokens: 1000, output_tokens: 500, pages: 0 },
    ///     },
    /// );
    /// assert_eq!(summary.total, Some(Decimal::new(4, 3)));
    /// ```
    #[must_use]
    pub fn summarize(&self, text: CostComponent<'_>, llm: CostComponent<'_>) -> CostSummary {
        let text_cost = text.pricing.map_or(Decimal::ZERO, |p| p.compute(text.usage));
        let llm_cost = llm.pricing.map_or(Decimal::ZERO, |p| p.compute(llm.usage));

        let charged: Vec<&str> = [(text.pricing, text_cost), (llm.pricing, llm_cost)]
            .iter()
            .filter(|(_, cost)| !cost.is_zero())
            .filter_map(|(p, _)| p.map(|p| p.currency.as_str()))
            .collect();

        let currency = match charged.as_slice() {
            [] => text
                .pricing
                .or(llm.pricing)
                .map(|p| p.currency.clone()),
            [first, rest @ ..] if rest.iter().all(|c| c.eq_ignore_ascii_case(first)) => {
                Some((*first).to_string())
            }
            _ => {
                tracing::warn!(
                    currencies = ?charged,
                    "Cost components use different currencies; total left undefined"
                );
                return CostSummary {
                    text_cost,
                    llm_cost,
                    total: None,
                    currency: None,
                };
            }
        };

        CostSummary {
            text_cost,
            llm_cost,
            total: Some(text_cost + llm_cost),
            currency,
        }
    }
}
