//! Enums persisted as text columns

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Account status stored in `users.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    /// Set only by admin tooling; billing events never lift it.
    Banned,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            "banned" => Ok(AccountStatus::Banned),
            _ => Err(ParseEnumError {
                kind: "account status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountLevel {
    Customer,
    Admin,
}

impl AccountLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountLevel::Customer => "customer",
            AccountLevel::Admin => "admin",
        }
    }
}

impl FromStr for AccountLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(AccountLevel::Customer),
            "admin" => Ok(AccountLevel::Admin),
            _ => Err(ParseEnumError {
                kind: "account level",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingCycle::Monthly),
            "annual" | "yearly" | "year" => Ok(BillingCycle::Annual),
            _ => Err(ParseEnumError {
                kind: "billing cycle",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Active".parse::<AccountStatus>().unwrap(), AccountStatus::Active);
        assert_eq!("BANNED".parse::<AccountStatus>().unwrap(), AccountStatus::Banned);
        assert!("paused".parse::<AccountStatus>().is_err());
    }

    #[test]
    fn billing_cycle_accepts_processor_intervals() {
        assert_eq!("month".parse::<BillingCycle>().unwrap(), BillingCycle::Monthly);
        assert_eq!("year".parse::<BillingCycle>().unwrap(), BillingCycle::Annual);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&AccountStatus::Inactive).unwrap();
        assert_eq!(json, "\"inactive\"");
    }
}
