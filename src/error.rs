//! Error types for the transactional memory core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StmError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("access violation: segment at {addr:#x} was freed by another transaction")]
    AccessViolation { addr: usize },

    #[error("double free: segment at {addr:#x} freed by both this and a peer transaction")]
    DoubleFree { addr: usize },

    #[error("no such segment at address {addr:#x}")]
    UnknownSegment { addr: usize },

    #[error("transaction already aborted")]
    AlreadyAborted,

    #[error("size {size} is not a positive multiple of alignment {align}")]
    Misaligned { size: usize, align: usize },

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, StmError>;
