pub mod budget;
pub mod completion;
pub mod enrichment;
pub mod logo;
pub mod queue;
pub mod storage;
