//! Property-based tests for the flow registry and flow blocks.

use proptest::prelude::*;
use tcpgrind_flow::{fill_byte_counting, FlowError, FlowId, FlowRegistry, FlowSettings, SourceSettings};

#[derive(Debug, Clone)]
enum Op {
    Admit,
    Abandon,
    Remove(usize),
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Admit),
        1 => Just(Op::Abandon),
        2 => (0usize..64).prop_map(Op::Remove),
    ]
}

proptest! {
    /// The registry never holds more than its ceiling, refusals change nothing,
    /// and abandoned reservations leave no trace.
    #[test]
    fn test_registry_capacity_invariant(
        max_flows in 1usize..16,
        ops in proptest::collection::vec(any_op(), 1..200),
    ) {
        let registry = FlowRegistry::new(max_flows);
        let mut live: Vec<FlowId> = Vec::new();

        for op in ops {
            match op {
                Op::Admit => {
                    let before = registry.snapshot();
                    match registry.reserve() {
                        Ok(reservation) => {
                            let flow = reservation.new_flow(
                                FlowSettings::default(),
                                SourceSettings::new("127.0.0.1", 5999),
                            );
                            live.push(reservation.commit(flow));
                        }
                        Err(FlowError::CapacityExceeded { max }) => {
                            prop_assert_eq!(max, max_flows);
                            prop_assert_eq!(live.len(), max_flows);
                            prop_assert_eq!(registry.snapshot(), before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::Abandon => {
                    let before = registry.len();
                    if let Ok(reservation) = registry.reserve() {
                        drop(reservation);
                    }
                    prop_assert_eq!(registry.len(), before);
                }
                Op::Remove(i) => {
                    if !live.is_empty() {
                        let id = live.remove(i % live.len());
                        prop_assert!(registry.destroy(id));
                    }
                }
            }
            prop_assert!(registry.len() <= max_flows);
            prop_assert_eq!(registry.len(), live.len());
            prop_assert_eq!(registry.snapshot().reserved, 0);
        }
    }

    /// Byte-counting blocks hold `i mod 256` at every offset.
    #[test]
    fn test_byte_counting_fidelity(size in 0usize..10_000) {
        let mut block = vec![0xAAu8; size];
        fill_byte_counting(&mut block);
        for (i, byte) in block.iter().enumerate() {
            prop_assert_eq!(*byte as usize, i % 256);
        }
    }
}
