//! Initializing the process-wide instance twice is a programming error.

use lsp::LspConfig;

#[test]
#[should_panic(expected = "initialized twice")]
fn test_second_init_panics() {
    lsp::init(LspConfig::default()).unwrap();
    let _ = lsp::init(LspConfig::default());
}
