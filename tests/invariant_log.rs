//! Invariant log bookkeeping. Kept in its own binary: clearing the log races
//! with contract checks in other tests of the same process.

use accel_arbiter::harness::ArbiterHarness;
use accel_arbiter::invariant_ppt::{clear_invariant_log, contract_test, RELEASE_FREES_CONTEXT};
use accel_arbiter::{ArgumentBlock, Primitive, PrimitiveParams};

#[test]
fn cleared_log_is_refilled_by_release() {
    let mut h = ArbiterHarness::new(&[Primitive::AudioFir]);
    let r = h
        .request(Primitive::AudioFir, 1, ArgumentBlock::new(PrimitiveParams::audio(5)))
        .unwrap();
    h.scheduler.release(r.id).unwrap();

    clear_invariant_log();
    if cfg!(feature = "ppt") {
        let missing = std::panic::catch_unwind(|| contract_test("cleared", &[RELEASE_FREES_CONTEXT]));
        assert!(missing.is_err(), "a cleared log should fail the contract");
    }

    let r = h
        .request(Primitive::AudioFir, 1, ArgumentBlock::new(PrimitiveParams::audio(5)))
        .unwrap();
    h.scheduler.release(r.id).unwrap();
    contract_test("release_after_clear", &[RELEASE_FREES_CONTEXT]);
}
