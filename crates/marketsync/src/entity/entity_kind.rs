//! Kinds of local entities that are reconciled against marketplaces.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Local entity kind.
///
/// The lowercase name doubles as the prefix of the events emitted for the
/// kind (`product.synced`, `order.sync_failed`, ...).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum, Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[sea_orm(string_value = "product")]
    Product,
    #[sea_orm(string_value = "order")]
    Order,
    #[sea_orm(string_value = "inventory")]
    Inventory,
    #[sea_orm(string_value = "price")]
    Price,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Order => "order",
            EntityKind::Inventory => "inventory",
            EntityKind::Price => "price",
        }
    }

    /// Plural form used in REST paths.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Order => "orders",
            EntityKind::Inventory => "inventory",
            EntityKind::Price => "prices",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "product" | "products" => Ok(EntityKind::Product),
            "order" | "orders" => Ok(EntityKind::Order),
            "inventory" | "stock" => Ok(EntityKind::Inventory),
            "price" | "prices" => Ok(EntityKind::Price),
            _ => Err(format!("Unknown entity kind: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_accepts_plurals() {
        assert_eq!(
            "products".parse::<EntityKind>().unwrap(),
            EntityKind::Product
        );
        assert_eq!("stock".parse::<EntityKind>().unwrap(), EntityKind::Inventory);
        assert!("invoice".parse::<EntityKind>().is_err());
    }
}
