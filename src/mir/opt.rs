use crate::error::{LD, LDCtx};
use crate::mir::*;
use rustc_hash::FxHashMap;
use std::env;

pub mod dom;
pub mod ldist;
pub mod loop_analysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdistConfig {
    /// Re-check the IR, dominator tree and loop nest after every distributed loop.
    pub verify: bool,
    /// Keep partitions whose stores are all conditional instead of folding them
    /// into a cyclic neighbour.
    pub distribute_non_if_convertible: bool,
    pub add_checks_for_store_to_load_forwarding: bool,
}

impl Default for LdistConfig {
    fn default() -> Self {
        Self {
            verify: false,
            distribute_non_if_convertible: false,
            add_checks_for_store_to_load_forwarding: true,
        }
    }
}

impl LdistConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            verify: env_bool("RR_LDIST_VERIFY", d.verify),
            distribute_non_if_convertible: env_bool(
                "RR_LDIST_NON_IF_CONVERTIBLE",
                d.distribute_non_if_convertible,
            ),
            add_checks_for_store_to_load_forwarding: env_bool(
                "RR_LDIST_STORE_TO_LOAD_CHECKS",
                d.add_checks_for_store_to_load_forwarding,
            ),
        }
    }
}

fn env_bool(key: &str, default_v: bool) -> bool {
    match env::var(key) {
        Ok(v) => parse_bool(&v),
        Err(_) => default_v,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LdistStats {
    pub loops_distributed: usize,
    pub loops_versioned: usize,
    pub loops_skipped: usize,
    pub partitions_created: usize,
}

impl LdistStats {
    pub fn accumulate(&mut self, other: Self) {
        self.loops_distributed += other.loops_distributed;
        self.loops_versioned += other.loops_versioned;
        self.loops_skipped += other.loops_skipped;
        self.partitions_created += other.partitions_created;
    }

    pub fn changed(self) -> bool {
        self.loops_distributed > 0
    }
}

pub struct TachyonEngine {
    config: LdistConfig,
}

impl Default for TachyonEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TachyonEngine {
    pub fn new() -> Self {
        Self::with_config(LdistConfig::from_env())
    }

    pub fn with_config(config: LdistConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LdistConfig {
        &self.config
    }

    fn verify_or_reject(fn_ir: &FnIR, stage: &str) -> bool {
        match crate::mir::verify::verify_ir(fn_ir) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    target: "loop-distribute",
                    "skipping {}: invalid MIR at {}: {}",
                    fn_ir.name,
                    stage,
                    e
                );
                false
            }
        }
    }

    pub fn run_function(&self, fn_ir: &mut FnIR) -> LD<bool> {
        Ok(self.run_function_with_stats(fn_ir)?.changed())
    }

    pub fn run_function_with_stats(&self, fn_ir: &mut FnIR) -> LD<LdistStats> {
        if !Self::verify_or_reject(fn_ir, "Start") {
            return Ok(LdistStats::default());
        }
        let stats = ldist::optimize(fn_ir, &self.config).ctx("run_function")?;
        log::info!(
            target: "loop-distribute",
            "{}: distributed {} loop(s) into {} partition(s), {} versioned, {} skipped",
            fn_ir.name,
            stats.loops_distributed,
            stats.partitions_created,
            stats.loops_versioned,
            stats.loops_skipped
        );
        Ok(stats)
    }

    pub fn run_program(&self, all_fns: &mut FxHashMap<String, FnIR>) -> LD<bool> {
        Ok(self.run_program_with_stats(all_fns)?.changed())
    }

    /// Runs every function in name order. The first fatal error aborts the unit.
    pub fn run_program_with_stats(&self, all_fns: &mut FxHashMap<String, FnIR>) -> LD<LdistStats> {
        let mut names: Vec<String> = all_fns.keys().cloned().collect();
        names.sort();
        let mut stats = LdistStats::default();
        for name in names {
            let Some(fn_ir) = all_fns.get_mut(&name) else {
                continue;
            };
            let s = self
                .run_function_with_stats(fn_ir)
                .map_err(|e| e.note(format!("while distributing loops in `{}`", name)))?;
            stats.accumulate(s);
        }
        Ok(stats)
    }
}
