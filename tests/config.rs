use std::path::Path;

use lightwave_sweep::config::{Config, load_config, load_document};

const BENCH_YAML: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bench.yaml");

#[test]
fn shipped_bench_file_spells_out_the_defaults() {
    let config = load_config(Path::new(BENCH_YAML)).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn shipped_bench_file_is_a_nested_mapping() {
    let doc = load_document(Path::new(BENCH_YAML)).unwrap();

    assert_eq!(
        doc["instruments"]["sourcemeter"]["address"].as_str(),
        Some("GPIB0::24::INSTR")
    );
    assert_eq!(doc["liv_sweep"]["center_wavelength"].as_f64(), Some(1550.0));
}
