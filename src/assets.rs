//! Asset index ↔ symbol catalog.
//!
//! The exchange addresses perps by position in the `meta` universe array.
//! Loaded from the `meta` info call at startup; a baked-in default keeps the
//! fill-correlation path working offline (testnet layout: BTC=3, ETH=4).

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    by_index: HashMap<u32, String>,
    by_symbol: HashMap<String, u32>,
}

impl AssetCatalog {
    pub fn new(entries: impl IntoIterator<Item = (u32, String)>) -> Self {
        let mut catalog = Self::default();
        for (idx, symbol) in entries {
            catalog.by_symbol.insert(symbol.clone(), idx);
            catalog.by_index.insert(idx, symbol);
        }
        catalog
    }

    /// Testnet universe positions observed for the majors.
    pub fn default_universe() -> Self {
        Self::new([(3, "BTC".to_string()), (4, "ETH".to_string())])
    }

    /// Build from a `meta` response: `{"universe": [{"name": "BTC"}, ...]}`,
    /// array position = asset index.
    pub fn from_meta(meta: &Value) -> Option<Self> {
        let universe = meta.get("universe")?.as_array()?;
        let entries: Vec<(u32, String)> = universe
            .iter()
            .enumerate()
            .filter_map(|(i, asset)| {
                asset
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|name| (i as u32, name.to_string()))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        info!("📇 Asset catalog loaded: {} assets", entries.len());
        Some(Self::new(entries))
    }

    pub fn symbol(&self, index: u32) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn index_of(&self, symbol: &str) -> Option<u32> {
        self.by_symbol.get(symbol).copied()
    }

    /// Display name for notifications; falls back to the raw index.
    pub fn display(&self, index: u32) -> String {
        self.symbol(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("ASSET-{index}"))
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_universe_majors() {
        let catalog = AssetCatalog::default_universe();
        assert_eq!(catalog.symbol(4), Some("ETH"));
        assert_eq!(catalog.index_of("BTC"), Some(3));
        assert_eq!(catalog.display(99), "ASSET-99");
    }

    #[test]
    fn test_from_meta_uses_array_position() {
        let meta = json!({
            "universe": [
                {"name": "SOL", "szDecimals": 2},
                {"name": "APT", "szDecimals": 2},
                {"name": "ATOM", "szDecimals": 2},
            ]
        });
        let catalog = AssetCatalog::from_meta(&meta).unwrap();
        assert_eq!(catalog.symbol(0), Some("SOL"));
        assert_eq!(catalog.index_of("ATOM"), Some(2));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_from_meta_rejects_empty() {
        assert!(AssetCatalog::from_meta(&json!({"universe": []})).is_none());
        assert!(AssetCatalog::from_meta(&json!({})).is_none());
    }
}
