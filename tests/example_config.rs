use std::collections::HashMap;
use std::path::Path;

use mayoche::{plan, synth, StackConfig};

#[test]
fn example_config_matches_defaults_and_deploys() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("mayoche.example.toml");
    let config = StackConfig::load_from(&path, Some(HashMap::new())).unwrap();

    let mut expected = StackConfig::default();
    expected.domain.hosted_zone_id = config.domain.hosted_zone_id.clone();
    expected.scraper.image_uri = config.scraper.image_uri.clone();
    assert_eq!(config, expected);

    let stack = synth(&config).unwrap();
    assert_eq!(plan(&stack).unwrap().len(), stack.template.resources.len());
}
