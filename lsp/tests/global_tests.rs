//! Process-wide instance lifecycle. Kept to a single test: the instance is
//! shared by every test in this binary.

use lsp::{LspConfig, LspError};

#[test]
fn test_init_instance_shutdown() {
    assert!(lsp::instance().is_none());
    lsp::shutdown().unwrap();

    let stack = lsp::init(LspConfig::default().with_addr(0x0042)).unwrap();
    let global = lsp::instance().unwrap();
    assert_eq!(global.address(), 0x0042);
    assert!(global.is_running());

    let sock = global.socket().unwrap();
    assert_eq!(stack.pool().in_use(), 1);
    global.close(sock).unwrap();

    lsp::shutdown().unwrap();
    assert!(lsp::instance().is_none());
    assert!(!stack.is_running());

    // A bad configuration leaves no instance behind.
    assert!(matches!(
        lsp::init(LspConfig::default().with_addr(0x1_0000)).unwrap_err(),
        LspError::AddressInvalid(_)
    ));
    assert!(lsp::instance().is_none());
}
