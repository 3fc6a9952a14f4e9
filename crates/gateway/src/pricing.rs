/// Input price per million tokens, by model-id prefix. First match wins.
///
/// Only the relative magnitude matters: the tool-output pipe skips
/// compression when the target model is cheaper than the compressor call.
const INPUT_PRICES: &[(&str, f64)] = &[
    ("claude-opus", 15.0),
    ("claude-sonnet", 3.0),
    ("claude-3-7-sonnet", 3.0),
    ("claude-3-5-sonnet", 3.0),
    ("claude-3-5-haiku", 0.8),
    ("claude-haiku", 0.8),
    ("gpt-4.1-nano", 0.1),
    ("gpt-4.1-mini", 0.4),
    ("gpt-4.1", 2.0),
    ("gpt-4o-mini", 0.15),
    ("gpt-4o", 2.5),
    ("gpt-5-mini", 0.25),
    ("gpt-5", 1.25),
    ("o3-mini", 1.1),
    ("o3", 2.0),
    ("gemini-2.5-pro", 1.25),
    ("gemini-2.5-flash-lite", 0.1),
    ("gemini-2.5-flash", 0.3),
    ("gemini-2.0-flash", 0.1),
];

/// Look up the input price for a model id, tolerating provider prefixes and
/// date suffixes (`anthropic/claude-sonnet-4-20250514` matches
/// `claude-sonnet`).
pub fn input_price_per_mtok(model: &str) -> Option<f64> {
    let bare = model.rsplit('/').next().unwrap_or(model);
    INPUT_PRICES
        .iter()
        .find(|(prefix, _)| bare.starts_with(prefix))
        .map(|(_, price)| *price)
}
