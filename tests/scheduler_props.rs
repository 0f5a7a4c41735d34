use accel_arbiter::harness::ArbiterHarness;
use accel_arbiter::{
    ArgumentBlock, Assignment, Primitive, PrimitiveParams, SchedulerConfig, VirtualRequest,
    MAX_CONTEXTS,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create(Primitive, u8),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (prop::sample::select(Primitive::ALL.to_vec()), 1u8..=10).prop_map(|(p, prio)| Op::Create(p, prio)),
        any::<prop::sample::Index>().prop_map(|i| Op::Release(i.index(usize::MAX))),
    ]
}

fn inventory() -> impl Strategy<Value = Vec<Primitive>> {
    prop::collection::vec(
        prop::sample::select(vec![Primitive::AudioFft, Primitive::AudioFir, Primitive::Gemm]),
        0..5,
    )
}

fn args(primitive: Primitive) -> ArgumentBlock {
    match primitive {
        Primitive::Gemm => ArgumentBlock::new(PrimitiveParams::gemm(4, 4, 4)),
        _ => ArgumentBlock::new(PrimitiveParams::audio(6)),
    }
}

fn held(live: &[VirtualRequest]) -> usize {
    live.iter()
        .map(|r| r.assignment.as_ref().map(|a| a.contexts().len()).unwrap_or(0))
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn grants_respect_contexts_and_primitives(devices in inventory(), ops in prop::collection::vec(op(), 1..60)) {
        let config = SchedulerConfig::default().with_cpu_fallback(false);
        let mut h = ArbiterHarness::with_config(config, &devices);
        let mut live: Vec<VirtualRequest> = Vec::new();

        for op in ops {
            match op {
                Op::Create(primitive, prio) => {
                    let before = h.scheduler.report();
                    match h.request(primitive, prio, args(primitive)) {
                        Ok(request) => {
                            match request.assignment.as_ref() {
                                Some(Assignment::Direct(grant)) => {
                                    let device = h.scheduler.device(grant.device).unwrap();
                                    prop_assert_eq!(device.primitive, primitive);
                                }
                                Some(Assignment::Pipeline { stages }) => {
                                    for stage in stages {
                                        let device = h.scheduler.device(stage.context.device).unwrap();
                                        prop_assert_eq!(device.primitive, stage.primitive);
                                    }
                                }
                                other => prop_assert!(false, "unexpected assignment {:?}", other),
                            }
                            live.push(request);
                        }
                        // A failed search leaves the inventory exactly as it was.
                        Err(_) => prop_assert_eq!(h.scheduler.report(), before),
                    }
                }
                Op::Release(index) => {
                    if !live.is_empty() {
                        let request = live.swap_remove(index % live.len());
                        h.scheduler.release(request.id).unwrap();
                        for grant in request.assignment.as_ref().unwrap().contexts() {
                            let device = h.scheduler.device(grant.device).unwrap();
                            prop_assert!(!device.contexts.contains(grant.context));
                        }
                    }
                }
            }
            prop_assert!(h.scheduler.devices().all(|d| d.contexts.count() <= MAX_CONTEXTS));
            prop_assert_eq!(h.scheduler.granted_contexts(), held(&live));
            prop_assert_eq!(h.scheduler.live_allocations(), live.len());
        }

        for request in live.drain(..) {
            h.scheduler.release(request.id).unwrap();
        }
        prop_assert_eq!(h.scheduler.granted_contexts(), 0);
    }

    /// After releasing everything the same sequence of grants lands on the
    /// same contexts again.
    #[test]
    fn released_contexts_are_reused(count in 1usize..=MAX_CONTEXTS * 2) {
        let mut h = ArbiterHarness::with_config(
            SchedulerConfig::default().with_cpu_fallback(false),
            &[Primitive::AudioFir, Primitive::AudioFir],
        );
        let grab = |h: &mut ArbiterHarness| -> Vec<VirtualRequest> {
            (0..count)
                .map(|_| h.request(Primitive::AudioFir, 5, args(Primitive::AudioFir)).unwrap())
                .collect()
        };
        let first = grab(&mut h);
        let placements: Vec<_> = first.iter().map(|r| (r.assigned_device(), r.assigned_context())).collect();
        for r in &first {
            h.scheduler.release(r.id).unwrap();
        }
        let second = grab(&mut h);
        let again: Vec<_> = second.iter().map(|r| (r.assigned_device(), r.assigned_context())).collect();
        prop_assert_eq!(placements, again);
    }
}
