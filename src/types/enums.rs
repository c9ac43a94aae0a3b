//! Ledger enumerations.
//!
//! Every enum has a stable SCREAMING_SNAKE_CASE string form used both for
//! serde and for the TEXT columns of the SQL backends.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Independent credit pools. A debit against one never touches the other.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditCategory {
    /// Per-document report generation.
    ReportCredits,
    /// Deep analysis priced by linked-process batch size.
    FullCredits,
}

text_enum!(CreditCategory, "credit category", {
    ReportCredits => "REPORT_CREDITS",
    FullCredits => "FULL_CREDITS",
});

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationType {
    /// Monthly plan bundle, granted by the allocator.
    Included,
    Purchased,
    /// Goodwill grants and refund replacements.
    Promotional,
}

text_enum!(AllocationType, "allocation type", {
    Included => "INCLUDED",
    Purchased => "PURCHASED",
    Promotional => "PROMOTIONAL",
});

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Debit,
    Refund,
    Allocation,
    Expiration,
}

text_enum!(TransactionType, "transaction type", {
    Debit => "DEBIT",
    Refund => "REFUND",
    Allocation => "ALLOCATION",
    Expiration => "EXPIRATION",
});

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    #[default]
    Active,
    Consumed,
    Released,
}

text_enum!(HoldStatus, "hold status", {
    Active => "ACTIVE",
    Consumed => "CONSUMED",
    Released => "RELEASED",
});

/// Subscription plan of a workspace.
///
/// The legacy Portuguese plan names are accepted on input.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Plan {
    #[default]
    Free,
    #[serde(alias = "GESTAO")]
    Starter,
    #[serde(alias = "PERFORMANCE")]
    Professional,
    Enterprise,
}

text_enum!(Plan, "plan", {
    Free => "FREE",
    Starter => "STARTER",
    Professional => "PROFESSIONAL",
    Enterprise => "ENTERPRISE",
});

impl Plan {
    /// Parses canonical names as well as the legacy aliases.
    pub fn parse_lenient(s: &str) -> Result<Self, ParseEnumError> {
        match s.to_ascii_uppercase().as_str() {
            "GESTAO" => Ok(Plan::Starter),
            "PERFORMANCE" => Ok(Plan::Professional),
            other => other.parse(),
        }
    }
}

/// Rate-limited operation kinds tracked per day for quota purposes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    ReportGenerated,
    FullAnalysis,
    ApiCall,
}

text_enum!(OperationType, "operation type", {
    ReportGenerated => "REPORT_GENERATED",
    FullAnalysis => "FULL_ANALYSIS",
    ApiCall => "API_CALL",
});
