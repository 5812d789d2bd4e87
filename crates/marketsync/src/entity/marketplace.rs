//! Marketplace enum identifying the remote sales channel.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Supported external marketplaces.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum, Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    #[sea_orm(string_value = "trendyol")]
    Trendyol,
    #[sea_orm(string_value = "n11")]
    N11,
    #[sea_orm(string_value = "amazon")]
    Amazon,
    #[sea_orm(string_value = "ebay")]
    Ebay,
    #[sea_orm(string_value = "hepsiburada")]
    Hepsiburada,
    #[sea_orm(string_value = "ozon")]
    Ozon,
}

impl Marketplace {
    /// All marketplaces in a stable order.
    pub const ALL: [Marketplace; 6] = [
        Marketplace::Trendyol,
        Marketplace::N11,
        Marketplace::Amazon,
        Marketplace::Ebay,
        Marketplace::Hepsiburada,
        Marketplace::Ozon,
    ];

    /// Lowercase identifier used in config keys, counter keys and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Trendyol => "trendyol",
            Marketplace::N11 => "n11",
            Marketplace::Amazon => "amazon",
            Marketplace::Ebay => "ebay",
            Marketplace::Hepsiburada => "hepsiburada",
            Marketplace::Ozon => "ozon",
        }
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Marketplace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trendyol" => Ok(Marketplace::Trendyol),
            "n11" => Ok(Marketplace::N11),
            "amazon" => Ok(Marketplace::Amazon),
            "ebay" => Ok(Marketplace::Ebay),
            "hepsiburada" | "hb" => Ok(Marketplace::Hepsiburada),
            "ozon" => Ok(Marketplace::Ozon),
            _ => Err(format!("Unknown marketplace: {}", s)),
        }
    }
}
