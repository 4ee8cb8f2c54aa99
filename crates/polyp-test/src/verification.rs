//! Verification helpers for link operations recorded by [`MockLinks`]
//!
//! [`MockLinks`]: crate::MockLinks

use thiserror::Error;

use crate::links::{LinkOp, OpKind};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected operation {expected:?} not recorded; recorded: {recorded:?}")]
    OpNotRecorded {
        expected: LinkOp,
        recorded: Vec<LinkOp>,
    },

    #[error("Unexpected {kind:?} on '{name}'")]
    UnexpectedOp { kind: OpKind, name: String },

    #[error("Expected {expected} {kind:?} operations, found {actual}")]
    OpCountMismatch {
        kind: OpKind,
        expected: usize,
        actual: usize,
    },

    #[error("Expected {first:?} before {then:?}")]
    OutOfOrder { first: LinkOp, then: LinkOp },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Link operation verifier
pub struct OpVerifier {
    recorded: Vec<LinkOp>,
}

impl OpVerifier {
    /// Create a verifier over a recorded operation log
    pub fn new(recorded: Vec<LinkOp>) -> Self {
        Self { recorded }
    }

    /// Verify that an operation was recorded
    pub fn assert_op(&self, expected: &LinkOp) -> VerifyResult<()> {
        if self.recorded.contains(expected) {
            Ok(())
        } else {
            Err(VerificationError::OpNotRecorded {
                expected: expected.clone(),
                recorded: self.recorded.clone(),
            })
        }
    }

    /// Verify that no operation of `kind` touched `name`
    pub fn assert_no_op_on(&self, kind: OpKind, name: &str) -> VerifyResult<()> {
        if self
            .recorded
            .iter()
            .any(|op| op.kind() == kind && op.name() == name)
        {
            Err(VerificationError::UnexpectedOp {
                kind,
                name: name.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Verify the number of operations of `kind`
    pub fn assert_op_count(&self, kind: OpKind, expected: usize) -> VerifyResult<()> {
        let actual = self.recorded.iter().filter(|op| op.kind() == kind).count();
        if actual != expected {
            Err(VerificationError::OpCountMismatch {
                kind,
                expected,
                actual,
            })
        } else {
            Ok(())
        }
    }

    /// Verify that `first` was recorded before `then`
    pub fn assert_order(&self, first: &LinkOp, then: &LinkOp) -> VerifyResult<()> {
        let position = |op: &LinkOp| self.recorded.iter().position(|r| r == op);
        match (position(first), position(then)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            (None, _) => self.assert_op(first),
            (_, None) => self.assert_op(then),
            _ => Err(VerificationError::OutOfOrder {
                first: first.clone(),
                then: then.clone(),
            }),
        }
    }

    /// Get all recorded operations
    pub fn recorded(&self) -> &[LinkOp] {
        &self.recorded
    }
}
