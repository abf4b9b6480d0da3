//! Runtime invariant checks with contract-test support
//!
//! Production code states its invariants with [`assert_invariant!`]. Every
//! check is recorded by message, so a contract test can run a scenario and
//! then require that the invariants it cares about were actually exercised.
//!
//! ```rust,ignore
//! assert_invariant!(pts > last_pts, "Frame timestamps strictly increase", "producer");
//!
//! #[tokio::test]
//! async fn contract_producer() {
//!     // ... run the producer ...
//!     contract_test("producer", &["Frame timestamps strictly increase"]);
//! }
//! ```
//!
//! A violation is logged; debug builds (and therefore tests) also panic.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock, PoisonError};

fn checked() -> &'static Mutex<HashSet<&'static str>> {
    static CHECKED: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();
    CHECKED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Assert an invariant and record that it was checked.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariants::__check_invariant($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariants::__check_invariant($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __check_invariant(condition: bool, message: &'static str, context: Option<&str>) {
    checked()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(message);

    if !condition {
        let ctx = context.unwrap_or("unknown");
        log::error!("INVARIANT VIOLATION [{}]: {}", ctx, message);
        if cfg!(debug_assertions) {
            panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
        }
    }
}

/// Whether an invariant with this message has been checked in this process
pub fn was_checked(message: &str) -> bool {
    checked()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(message)
}

/// Panic unless every listed invariant has been checked at least once.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|invariant| !was_checked(invariant))
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: The following invariants were not checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}
