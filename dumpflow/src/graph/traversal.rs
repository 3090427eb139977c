//! Walks over the parent/child links of the job graph.
//!
//! Both walks keep a visited set: a repeated id means the arena holds a
//! cycle, which is reported as [`DumpflowError::CycleDetected`].

use super::StageExecutionRecord;
use crate::errors::{DumpflowError, Result};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn lookup(records: &HashMap<Uuid, StageExecutionRecord>, id: Uuid) -> Result<&StageExecutionRecord> {
    records.get(&id).ok_or(DumpflowError::UnknownExecution(id))
}

/// Ids from `id` up to its root, starting with `id`.
pub(crate) fn ancestors(records: &HashMap<Uuid, StageExecutionRecord>, id: Uuid) -> Result<Vec<Uuid>> {
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    let mut current = Some(id);

    while let Some(cur) = current {
        if !seen.insert(cur) {
            return Err(DumpflowError::CycleDetected(cur));
        }
        let record = lookup(records, cur)?;
        path.push(cur);
        current = record.parent_id;
    }

    Ok(path)
}

/// Ids of `root` and every descendant, parents before children, siblings in
/// scheduling order.
pub(crate) fn descendants(records: &HashMap<Uuid, StageExecutionRecord>, root: Uuid) -> Result<Vec<Uuid>> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root];

    while let Some(cur) = stack.pop() {
        if !seen.insert(cur) {
            return Err(DumpflowError::CycleDetected(cur));
        }
        let record = lookup(records, cur)?;
        order.push(cur);
        stack.extend(record.children_ids.iter().rev().copied());
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(links: &[(Uuid, Option<Uuid>, Vec<Uuid>)]) -> HashMap<Uuid, StageExecutionRecord> {
        links
            .iter()
            .map(|(id, parent, children)| {
                let mut rec = StageExecutionRecord::new(*id, format!("s-{id}"), *parent);
                rec.children_ids = children.clone();
                (*id, rec)
            })
            .collect()
    }

    #[test]
    fn test_ancestors_stop_at_root() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let records = arena(&[(a, None, vec![b]), (b, Some(a), vec![c]), (c, Some(b), vec![])]);

        assert_eq!(ancestors(&records, c).unwrap(), vec![c, b, a]);
        assert_eq!(ancestors(&records, a).unwrap(), vec![a]);
    }

    #[test]
    fn test_descendants_preorder_with_fanout() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let records = arena(&[
            (a, None, vec![b, d]),
            (b, Some(a), vec![c]),
            (c, Some(b), vec![]),
            (d, Some(a), vec![]),
        ]);

        assert_eq!(descendants(&records, a).unwrap(), vec![a, b, c, d]);
    }

    #[test]
    fn test_parent_cycle_fails_loudly() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let records = arena(&[(a, Some(b), vec![b]), (b, Some(a), vec![a])]);

        assert!(matches!(ancestors(&records, a), Err(DumpflowError::CycleDetected(_))));
        assert!(matches!(descendants(&records, a), Err(DumpflowError::CycleDetected(_))));
    }

    #[test]
    fn test_dangling_link_is_unknown_execution() {
        let (a, ghost) = (Uuid::new_v4(), Uuid::new_v4());
        let records = arena(&[(a, None, vec![ghost])]);

        assert!(matches!(
            descendants(&records, a),
            Err(DumpflowError::UnknownExecution(id)) if id == ghost
        ));
    }
}
