use serde::{Deserialize, Serialize};

/// which optional parts of the topology get declared. the static site,
/// its distribution, certificate and DNS record are always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// data bucket, its `data/*.json` route and the daily scraper.
    pub scraper: bool,
    /// vote table and the REST api in front of it.
    pub api: bool,
}

impl Default for Features {
    fn default() -> Self {
        Variant::Full.features()
    }
}

/// the three deployments mayoche has run, as named presets of [`Features`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Variant {
    Frontend,
    Scraper,
    Full,
}

impl Variant {
    pub fn features(&self) -> Features {
        match self {
            Variant::Frontend => Features { scraper: false, api: false },
            Variant::Scraper => Features { scraper: true, api: false },
            Variant::Full => Features { scraper: true, api: true },
        }
    }

    pub fn all() -> [Variant; 3] {
        [Variant::Frontend, Variant::Scraper, Variant::Full]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_variant_adds_to_the_previous() {
        let [frontend, scraper, full] = Variant::all().map(|v| v.features());
        assert_eq!(frontend, Features { scraper: false, api: false });
        assert!(scraper.scraper && !scraper.api);
        assert_eq!(full, Features::default());
    }
}
