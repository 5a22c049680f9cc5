// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The `/nix-cache-info` metadata document.

use cadenza_store_core::store_path::StoreDir;

/// Metadata a cache advertises at `/nix-cache-info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub store_dir: StoreDir,
    /// Whether bulk existence queries are worthwhile against this cache.
    pub want_mass_query: bool,
    /// Substituter priority; lower wins.
    pub priority: u32,
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self {
            store_dir: StoreDir::default(),
            want_mass_query: false,
            priority: 50,
        }
    }
}

impl CacheInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = CacheInfo::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "StoreDir" => {
                    if let Ok(dir) = StoreDir::new(value) {
                        info.store_dir = dir;
                    }
                }
                "WantMassQuery" => info.want_mass_query = value == "1",
                "Priority" => info.priority = value.parse().unwrap_or(info.priority),
                _ => {}
            }
        }
        info
    }

    pub fn render(&self) -> String {
        format!(
            "StoreDir: {}\nWantMassQuery: {}\nPriority: {}\n",
            self.store_dir,
            u8::from(self.want_mass_query),
            self.priority
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let info = CacheInfo {
            store_dir: StoreDir::default(),
            want_mass_query: true,
            priority: 40,
        };
        assert_eq!(CacheInfo::parse(&info.render()), info);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let info = CacheInfo::parse("StoreDir: /nix/store\n");
        assert_eq!(info.priority, 50);
        assert!(!info.want_mass_query);
    }
}
