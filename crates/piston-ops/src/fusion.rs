//! # Fusion
//!
//! Merges a chain of elementwise operations into the kernel of the operation they are
//! attached to. Every attached operation gets a 1-based link index, its arguments and
//! local identifiers are postfixed with `_link{i}` so the chain shares one namespace,
//! and its fragment is emitted in attachment order.
use slotmap::{SlotMap, new_key_type};

use crate::{ArgumentSet, ElementwiseOperation, GpuOperation, TensorDescriptor, TensorId};

new_key_type! {
    /// Handle to an [`ElementwiseOperation`] stored in a [`Linkables`] arena.
    pub struct ElementwiseId;
}

/// Caller-owned arena of elementwise operations.
///
/// Operations attached to a composite must stay in the arena until the composite is
/// dropped. A handle removed before compilation surfaces as
/// [`FusionError::DanglingOperation`].
pub type Linkables = SlotMap<ElementwiseId, ElementwiseOperation>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FusionError {
    #[error("Argument `{0}` is defined by more than one fused operation")]
    ArgumentCollision(String),
    #[error("{op} (link {link}) expects {expected} source channels, primary input has {actual}")]
    ChannelMismatch {
        op: String,
        link: usize,
        expected: usize,
        actual: usize,
    },
    #[error("{op} (link {link}) checks source channels but no primary input is bound")]
    UnboundPrimaryInput { op: String, link: usize },
    #[error("Linked operation {0:?} no longer exists")]
    DanglingOperation(ElementwiseId),
    #[error("{0} cannot be linked")]
    NotLinkable(String),
    #[error("{op} is already linked at position {link}")]
    AlreadyLinked { op: String, link: usize },
    #[error("Kernel body of {0} has no linked operations marker")]
    MissingLinkMarker(String),
}

/// Output of [`merge_operations`]: the union of all postfixed arguments and the
/// concatenated code of the chain.
#[derive(Debug, Default)]
pub struct MergedOperations {
    pub args: ArgumentSet,
    pub code: String,
    /// Inputs beyond the primary one that linked operations read, in link order.
    pub src_tensors: Vec<LinkedSource>,
}

/// An extra input of a linked operation, under its postfixed argument name.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedSource {
    pub name: String,
    pub desc: TensorDescriptor,
    /// Tensor bound on the elementwise operation before linking, if any.
    pub tensor: Option<TensorId>,
}

/// Fails with [`FusionError::ArgumentCollision`] if any argument of `linked` would,
/// once postfixed, take a name already in `existing`. Reads only.
pub fn check_link_names(
    linked: &[ElementwiseId],
    linkables: &Linkables,
    existing: &ArgumentSet,
) -> Result<(), FusionError> {
    for (position, &id) in linked.iter().enumerate() {
        let Some(op) = linkables.get(id) else {
            continue;
        };
        let link = position + 1;
        if let Some(name) = op
            .args()
            .names()
            .map(|name| format!("{name}_link{link}"))
            .find(|name| existing.contains(name))
        {
            return Err(FusionError::ArgumentCollision(name));
        }
    }
    Ok(())
}

/// Merges `linked` (in attachment order) into one argument set and one code block.
///
/// `primary_src_channels` is the channel count of the composite's first input, used by
/// operations that check their source channels. Nothing is mutated unless every
/// operation passes validation.
pub fn merge_operations(
    linked: &[ElementwiseId],
    linkables: &mut Linkables,
    primary_src_channels: Option<usize>,
) -> Result<MergedOperations, FusionError> {
    let mut merged = MergedOperations::default();
    if linked.is_empty() {
        return Ok(merged);
    }

    for (position, &id) in linked.iter().enumerate() {
        let link = position + 1;
        let op = linkables.get(id).ok_or(FusionError::DanglingOperation(id))?;
        if !op.is_linkable() {
            return Err(FusionError::NotLinkable(op.name().to_string()));
        }
        if op.link_index() != 0 || linked[..position].contains(&id) {
            return Err(FusionError::AlreadyLinked {
                op: op.name().to_string(),
                link: op.link_index().max(1),
            });
        }
        if let Some(expected) = op.expected_src_channels() {
            let actual = primary_src_channels.ok_or_else(|| FusionError::UnboundPrimaryInput {
                op: op.name().to_string(),
                link,
            })?;
            if expected != actual {
                return Err(FusionError::ChannelMismatch {
                    op: op.name().to_string(),
                    link,
                    expected,
                    actual,
                });
            }
        }
    }

    for (position, &id) in linked.iter().enumerate() {
        let link = position + 1;
        let op = linkables
            .get_mut(id)
            .ok_or(FusionError::DanglingOperation(id))?;
        op.set_link_index(link);
        op.add_unique_postfix(&format!("_link{link}"));
        merged.src_tensors.extend(op.extra_sources());
        merged.args.merge(op.move_args())?;

        merged
            .code
            .push_str(&format!("// {} (link {link})\n", op.name()));
        merged.code.push_str("{\n");
        for line in op.code().lines() {
            merged.code.push_str(&format!("    {line}\n"));
        }
        merged.code.push_str("}\n");
    }

    log::debug!(
        "Merged {} linked operations with {} arguments",
        linked.len(),
        merged.args.len()
    );
    Ok(merged)
}
