use crate::bail;
use crate::error::{LD, LDCode, Stage};
use crate::mir::analyze::access::Dependence;
use crate::mir::opt::ldist::partition::PartitionContainer;
use crate::mir::ValueId;

/// Net number of possibly-backward dependences starting (+1) or ending (-1)
/// at each access, in program order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeDeltas {
    deltas: Vec<i32>,
}

impl UnsafeDeltas {
    pub fn new(num_accesses: usize, deps: &[Dependence]) -> LD<Self> {
        let mut deltas = vec![0i32; num_accesses];
        for dep in deps.iter().filter(|d| d.is_possibly_backward()) {
            if dep.source >= num_accesses || dep.destination >= num_accesses {
                bail!(
                    "Seeder",
                    LDCode::E4001,
                    Stage::Seed,
                    "dependence {} -> {} names an access outside 0..{}",
                    dep.source,
                    dep.destination,
                    num_accesses
                );
            }
            deltas[dep.source] += 1;
            deltas[dep.destination] -= 1;
        }
        Ok(Self { deltas })
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.deltas
    }

    /// Assigns each access to a partition. Returns the number of active
    /// unsafe dependences after every access.
    ///
    /// An access joins the current cyclic partition while a dependence spans
    /// it or when it opens one; every other access gets its own non-cyclic
    /// partition.
    pub fn seed(&self, accesses: &[ValueId], parts: &mut PartitionContainer) -> LD<Vec<i32>> {
        if accesses.len() != self.deltas.len() {
            bail!(
                "Seeder",
                LDCode::ICE9001,
                Stage::Seed,
                "{} accesses but {} dependence deltas",
                accesses.len(),
                self.deltas.len()
            );
        }
        let mut active = 0i32;
        let mut trace = Vec::with_capacity(accesses.len());
        for (idx, (&inst, &delta)) in accesses.iter().zip(&self.deltas).enumerate() {
            // The count is updated after classification; a dependence
            // starting here is caught through its own delta.
            if active > 0 || delta > 0 {
                parts.add_to_cyclic_partition(inst);
            } else {
                parts.add_to_new_non_cyclic_partition(inst);
            }
            active += delta;
            if active < 0 {
                bail!(
                    "Seeder",
                    LDCode::E4001,
                    Stage::Seed,
                    "negative number of active unsafe dependences at access {}",
                    idx
                );
            }
            trace.push(active);
        }
        Ok(trace)
    }
}
