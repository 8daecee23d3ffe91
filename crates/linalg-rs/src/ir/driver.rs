use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::ir::{
    index::{FunctionIndexError, InstId},
    legality::{
        check_function_legality, ConversionDiagnostic, ConversionStage, ConversionTarget,
        LegalityReport,
    },
    pattern::FrozenPatternSet,
    rewriter::ProgramRewriter,
    spec::{Function, Operation, Program},
};

#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub max_iterations: usize,
    pub enable_dce: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_iterations: usize::MAX,
            enable_dce: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConversionStats {
    pub iterations: usize,
    pub applied: usize,
    pub dce_removed: usize,
    /// One entry per failed pattern attempt on an illegal operation.
    pub diagnostics: Vec<ConversionDiagnostic>,
}

impl ConversionStats {
    fn merge(&mut self, other: ConversionStats) {
        self.iterations += other.iterations;
        self.applied += other.applied;
        self.dce_removed += other.dce_removed;
        self.diagnostics.extend(other.diagnostics);
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Index(#[from] FunctionIndexError),
    #[error("{} illegal operation(s) remain after conversion", report.diagnostics.len())]
    IllegalOperations {
        report: LegalityReport,
        stats: ConversionStats,
    },
}

/// Rewrites illegal operations of `func` with the provided patterns.
///
/// Operations no pattern can lower are left untouched and recorded as
/// diagnostics; this never fails because of a pattern.
pub fn apply_partial_conversion(
    func: &mut Function,
    patterns: &FrozenPatternSet,
    target: &ConversionTarget,
    cfg: &ConversionConfig,
) -> Result<ConversionStats, ConversionError> {
    let function_name = func.name.clone();
    let mut rewriter = ProgramRewriter::new(func)?;
    let mut worklist = VecDeque::new();
    seed_worklist(&rewriter, &mut worklist);

    let mut failure_cache: HashMap<(usize, InstId), u32> = HashMap::new();
    let mut stats = ConversionStats::default();

    while let Some(inst) = worklist.pop_front() {
        if stats.iterations >= cfg.max_iterations {
            break;
        }
        if !rewriter.contains(inst) {
            continue;
        }
        let Some(op_snapshot) = rewriter.op(inst).cloned() else {
            continue;
        };
        if !target.is_illegal(&op_snapshot) {
            continue;
        }

        let version = rewriter.version(inst).unwrap_or(0);
        for (idx, pattern) in patterns.matching(&op_snapshot) {
            if failure_cache.get(&(idx, inst)).copied() == Some(version) {
                continue;
            }
            stats.iterations = stats.iterations.saturating_add(1);
            match pattern.match_and_rewrite(inst, &mut rewriter) {
                Ok(()) => {
                    tracing::debug!(
                        function = %function_name,
                        pattern = pattern.name(),
                        op = ?op_snapshot,
                        "pattern applied"
                    );
                    stats.applied += 1;
                    clear_failure_entries(inst, &mut failure_cache);
                    seed_worklist(&rewriter, &mut worklist);
                    break;
                }
                Err(err) => {
                    tracing::debug!(
                        function = %function_name,
                        pattern = pattern.name(),
                        op = ?op_snapshot,
                        reason = %err,
                        "pattern failed to match"
                    );
                    failure_cache.insert((idx, inst), version);
                    stats.diagnostics.push(ConversionDiagnostic::new(
                        ConversionStage::Lower,
                        Some(function_name.clone()),
                        rewriter.insts_in_order().iter().position(|id| *id == inst),
                        format!("{}: {err}", pattern.name()),
                    ));
                }
            }
            if stats.iterations >= cfg.max_iterations {
                break;
            }
        }
    }

    if cfg.enable_dce {
        stats.dce_removed = run_dce(&mut rewriter)?;
    }

    tracing::info!(
        function = %function_name,
        applied = stats.applied,
        failures = stats.diagnostics.len(),
        dce_removed = stats.dce_removed,
        "partial conversion finished"
    );
    Ok(stats)
}

/// Like [`apply_partial_conversion`], but fails when illegal operations remain.
pub fn apply_full_conversion(
    func: &mut Function,
    patterns: &FrozenPatternSet,
    target: &ConversionTarget,
    cfg: &ConversionConfig,
) -> Result<ConversionStats, ConversionError> {
    let stats = apply_partial_conversion(func, patterns, target, cfg)?;
    let mut report = LegalityReport::default();
    check_function_legality(func, target, &mut report);
    if report.is_ok() {
        return Ok(stats);
    }
    tracing::warn!(
        function = %func.name,
        remaining = report.diagnostics.len(),
        "illegal operations remain after conversion"
    );
    report.diagnostics.extend(stats.diagnostics.iter().cloned());
    Err(ConversionError::IllegalOperations { report, stats })
}

/// Runs full conversion over every function of `program`.
pub fn convert_program(
    program: &mut Program,
    patterns: &FrozenPatternSet,
    target: &ConversionTarget,
    cfg: &ConversionConfig,
) -> Result<ConversionStats, ConversionError> {
    let mut total = ConversionStats::default();
    for function in &mut program.functions {
        total.merge(apply_full_conversion(function, patterns, target, cfg)?);
    }
    Ok(total)
}

fn seed_worklist(rewriter: &ProgramRewriter, worklist: &mut VecDeque<InstId>) {
    worklist.clear();
    for inst in rewriter.insts_in_order() {
        worklist.push_back(inst);
    }
}

fn clear_failure_entries(inst: InstId, cache: &mut HashMap<(usize, InstId), u32>) {
    cache.retain(|(_, cached_inst), _| *cached_inst != inst);
}

fn run_dce(rewriter: &mut ProgramRewriter) -> Result<usize, FunctionIndexError> {
    let mut removed_total = 0;
    loop {
        let mut removed_in_pass = 0;
        for inst in rewriter.insts_in_order().into_iter().rev() {
            if !rewriter.contains(inst) {
                continue;
            }
            if rewriter.op(inst).is_none_or(is_side_effecting) {
                continue;
            }
            let Some(value) = rewriter.value_of(inst) else {
                continue;
            };
            if rewriter.is_function_result(value) {
                continue;
            }
            if rewriter.users_of(value).is_empty() {
                rewriter.erase_inst(inst)?;
                removed_in_pass += 1;
            }
        }
        if removed_in_pass == 0 {
            break;
        }
        removed_total += removed_in_pass;
    }
    Ok(removed_total)
}

fn is_side_effecting(op: &Operation) -> bool {
    matches!(op, Operation::Assert(_))
}
