// ═══════════════════════════════════════════════════════════════════════════════
// CONSENSUS - VALIDITY GATE + FORK CHOICE
// ═══════════════════════════════════════════════════════════════════════════════
//
// Every block, locally produced or imported, passes through the same path:
//
//   ┌──────────────┐    ┌─────────────────────────┐    ┌──────────────────┐
//   │ Block        │───▶│ ValidityGate            │───▶│ ChainManager     │
//   │ (assembled / │    │  1. structure + roots   │    │  longest chain,  │
//   │  imported)   │    │  2. BlockJudge verdict  │    │  bounded reorgs, │
//   └──────────────┘    └─────────────────────────┘    │  finality        │
//                                                      └──────────────────┘
//
// The judge is pluggable. Difficulty is tracked by the gate and adjusted
// every DIFFICULTY_ADJUSTMENT_INTERVAL accepted blocks.
//
// ═══════════════════════════════════════════════════════════════════════════════

pub mod difficulty;
pub mod fork_choice;
pub mod judge;
pub mod validity;

pub use difficulty::DifficultyManager;
pub use fork_choice::{
    ChainManager, ChainStats, ForkChoiceOutcome, ForkSummary, Reorganization, ReorgRefusal,
    SegmentState, SideChain, MAX_ORPHANS,
};
pub use judge::{BlockJudge, HeuristicJudge, JudgeContext, Judgment, JudgmentFlags, StaticJudge};
pub use validity::{GateContext, GateRejection, GateStats, ValidityGate};
