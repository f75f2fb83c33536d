use std::collections::HashMap;

use bifrost_provider_core::{Key, KeySet};

fn weighted_set() -> KeySet {
    KeySet::new(vec![
        Key::new("A", "sk-a").with_models(["m1"]).with_weight(1.0),
        Key::new("B", "sk-b").with_models(["m1"]).with_weight(3.0),
    ])
}

#[test]
fn selection_frequency_tracks_weights() {
    let set = weighted_set();
    let mut counts: HashMap<String, u32> = HashMap::new();

    const DRAWS: u32 = 100_000;
    for _ in 0..DRAWS {
        let key = set.select_for_model("m1").expect("candidates exist");
        *counts.entry(key.id).or_default() += 1;
    }

    let freq_a = f64::from(counts["A"]) / f64::from(DRAWS);
    let freq_b = f64::from(counts["B"]) / f64::from(DRAWS);

    assert!((0.235..=0.265).contains(&freq_a), "freq(A) = {freq_a}");
    assert!((0.735..=0.765).contains(&freq_b), "freq(B) = {freq_b}");
}

#[test]
fn equal_weights_are_uniform() {
    let set = KeySet::new(vec![
        Key::new("x", "sk-x").with_models(["m"]).with_weight(2.0),
        Key::new("y", "sk-y").with_models(["m"]).with_weight(2.0),
    ]);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..20_000 {
        let key = set.select_for_model("m").unwrap();
        *counts.entry(key.id).or_default() += 1;
    }

    let freq_x = f64::from(counts["x"]) / 20_000.0;
    assert!((0.46..=0.54).contains(&freq_x), "freq(x) = {freq_x}");
}
