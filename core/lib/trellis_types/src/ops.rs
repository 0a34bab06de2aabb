use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{block::Block, transform::Transform};

/// One step of a structural path into a block payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSeg {
    fn from(value: &str) -> Self {
        PathSeg::Key(value.to_string())
    }
}

impl From<usize> for PathSeg {
    fn from(value: usize) -> Self {
        PathSeg::Index(value)
    }
}

/// A single mutation against a block payload. Ops are ordered within an
/// action; application order for one block is insert, then updates, then
/// delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Write `value` at `path`, creating the final object key if absent.
    Set { path: Vec<PathSeg>, value: Value },
    /// Remove the object key or array element at `path`.
    Remove { path: Vec<PathSeg> },
    /// Replace `remove` elements of the array at `path` starting at `index`
    /// with `insert`.
    Splice {
        path: Vec<PathSeg>,
        index: usize,
        remove: usize,
        insert: Vec<Value>,
    },
}

impl Op {
    pub fn set(path: Vec<PathSeg>, value: Value) -> Self {
        Op::Set { path, value }
    }

    pub fn append(path: Vec<PathSeg>, index: usize, values: Vec<Value>) -> Self {
        Op::Splice {
            path,
            index,
            remove: 0,
            insert: values,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OpError {
    #[error("path step {step} does not resolve in payload")]
    PathUnresolved { step: usize },
    #[error("expected an array at the op target")]
    NotAnArray,
    #[error("expected an object at the op target")]
    NotAnObject,
    #[error("splice range {index}+{remove} exceeds array length {len}")]
    SpliceOutOfRange {
        index: usize,
        remove: usize,
        len: usize,
    },
}

fn descend<'a>(root: &'a mut Value, path: &[PathSeg]) -> Result<&'a mut Value, OpError> {
    let mut cur = root;
    for (step, seg) in path.iter().enumerate() {
        cur = match seg {
            PathSeg::Key(key) => cur
                .as_object_mut()
                .ok_or(OpError::NotAnObject)?
                .get_mut(key)
                .ok_or(OpError::PathUnresolved { step })?,
            PathSeg::Index(idx) => cur
                .as_array_mut()
                .ok_or(OpError::NotAnArray)?
                .get_mut(*idx)
                .ok_or(OpError::PathUnresolved { step })?,
        };
    }
    Ok(cur)
}

/// Applies one op to a payload in place.
pub fn apply_op(payload: &mut Value, op: &Op) -> Result<(), OpError> {
    match op {
        Op::Set { path, value } => {
            let Some((last, parent_path)) = path.split_last() else {
                *payload = value.clone();
                return Ok(());
            };
            let parent = descend(payload, parent_path)?;
            match last {
                PathSeg::Key(key) => {
                    parent
                        .as_object_mut()
                        .ok_or(OpError::NotAnObject)?
                        .insert(key.clone(), value.clone());
                }
                PathSeg::Index(idx) => {
                    let arr = parent.as_array_mut().ok_or(OpError::NotAnArray)?;
                    let slot = arr.get_mut(*idx).ok_or(OpError::PathUnresolved {
                        step: path.len() - 1,
                    })?;
                    *slot = value.clone();
                }
            }
            Ok(())
        }
        Op::Remove { path } => {
            let Some((last, parent_path)) = path.split_last() else {
                *payload = Value::Null;
                return Ok(());
            };
            let parent = descend(payload, parent_path)?;
            match last {
                PathSeg::Key(key) => {
                    parent
                        .as_object_mut()
                        .ok_or(OpError::NotAnObject)?
                        .remove(key);
                }
                PathSeg::Index(idx) => {
                    let arr = parent.as_array_mut().ok_or(OpError::NotAnArray)?;
                    if *idx >= arr.len() {
                        return Err(OpError::PathUnresolved {
                            step: path.len() - 1,
                        });
                    }
                    arr.remove(*idx);
                }
            }
            Ok(())
        }
        Op::Splice {
            path,
            index,
            remove,
            insert,
        } => {
            let target = descend(payload, path)?;
            let arr = target.as_array_mut().ok_or(OpError::NotAnArray)?;
            if index + remove > arr.len() {
                return Err(OpError::SpliceOutOfRange {
                    index: *index,
                    remove: *remove,
                    len: arr.len(),
                });
            }
            arr.splice(*index..*index + *remove, insert.iter().cloned());
            Ok(())
        }
    }
}

/// Applies a block's transform slice to a prior block view, honouring the
/// insert -> update -> delete order. Returns the block after the action, or
/// `None` when the action deletes it.
pub fn apply_transform(
    prior: Option<&Block>,
    transform: &Transform,
) -> Result<Option<Block>, OpError> {
    let mut block = match (&transform.insert, prior) {
        (Some(inserted), _) => Some(inserted.clone()),
        (None, Some(existing)) => Some(existing.clone()),
        (None, None) => None,
    };
    if let Some(block) = block.as_mut() {
        for op in &transform.updates {
            apply_op(&mut block.payload, op)?;
        }
    }
    if transform.delete {
        return Ok(None);
    }
    Ok(block)
}
