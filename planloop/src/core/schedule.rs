//! Conflict-aware batch scheduler.
//!
//! Groups pending tasks into batches that are safe to dispatch together:
//! two tasks never share a batch if their declared file sets overlap. The
//! algorithm is greedy and order-stable, so the partition is a deterministic
//! function of input order.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::plan::TaskRecord;

/// A group of tasks dispatched together.
///
/// Invariant: within a parallel batch all file sets are pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub tasks: Vec<TaskRecord>,
    pub parallel: bool,
}

/// Partition `tasks` into an ordered list of batches.
///
/// Tasks with an empty file set each get their own sequential batch first:
/// an unproven footprint is not provably safe to parallelize. The remainder
/// is grouped greedily: pop the first task, scan forward adding any task
/// whose files are disjoint from the batch's accumulated set, stop at
/// `max_parallel`. Size-1 batches are sequential.
pub fn build_batches(tasks: &[TaskRecord], max_parallel: usize) -> Vec<Batch> {
    let mut remaining: Vec<TaskRecord> = Vec::new();
    let mut batches = Vec::new();

    for task in tasks {
        if task.files.is_empty() {
            batches.push(Batch {
                tasks: vec![task.clone()],
                parallel: false,
            });
        } else {
            remaining.push(task.clone());
        }
    }

    while !remaining.is_empty() {
        let first = remaining.remove(0);
        let mut batch_files: BTreeSet<String> = first.files.clone();
        let mut batch_tasks = vec![first];

        let mut idx = 0;
        while idx < remaining.len() && batch_tasks.len() < max_parallel {
            if remaining[idx].files.is_disjoint(&batch_files) {
                let task = remaining.remove(idx);
                batch_files.extend(task.files.iter().cloned());
                batch_tasks.push(task);
            } else {
                idx += 1;
            }
        }

        let parallel = batch_tasks.len() > 1;
        batches.push(Batch {
            tasks: batch_tasks,
            parallel,
        });
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(number: u32, files: &[&str]) -> TaskRecord {
        TaskRecord {
            number,
            title: format!("Task {number}"),
            files: files.iter().map(|f| (*f).to_string()).collect(),
            verify: Some("echo ok".to_string()),
            section_text: String::new(),
        }
    }

    #[test]
    fn independent_tasks_share_one_parallel_batch() {
        let tasks = vec![
            task(1, &["a.rs"]),
            task(2, &["b.rs"]),
            task(3, &["c.rs"]),
        ];
        let batches = build_batches(&tasks, 4);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].parallel);
        assert_eq!(batches[0].tasks.len(), 3);
    }

    #[test]
    fn conflicting_tasks_get_separate_sequential_batches() {
        let tasks = vec![
            task(1, &["shared.rs"]),
            task(2, &["shared.rs"]),
            task(3, &["shared.rs"]),
        ];
        let batches = build_batches(&tasks, 4);
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert!(!batch.parallel);
            assert_eq!(batch.tasks.len(), 1);
        }
    }

    #[test]
    fn empty_file_sets_are_isolated_and_scheduled_first() {
        let tasks = vec![task(1, &["a.rs"]), task(2, &[]), task(3, &["b.rs"])];
        let batches = build_batches(&tasks, 4);
        assert_eq!(batches.len(), 2);
        assert!(!batches[0].parallel);
        assert_eq!(batches[0].tasks[0].number, 2);
        assert!(batches[1].parallel);
        assert_eq!(batches[1].tasks.len(), 2);
    }

    #[test]
    fn max_parallelism_caps_batch_size() {
        let tasks = vec![
            task(1, &["a.rs"]),
            task(2, &["b.rs"]),
            task(3, &["c.rs"]),
            task(4, &["d.rs"]),
        ];
        let batches = build_batches(&tasks, 2);
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert!(batch.parallel);
            assert_eq!(batch.tasks.len(), 2);
        }
    }

    #[test]
    fn partitions_every_task_exactly_once() {
        let tasks = vec![
            task(1, &["a.rs", "b.rs"]),
            task(2, &["b.rs"]),
            task(3, &["c.rs"]),
            task(4, &[]),
            task(5, &["a.rs"]),
        ];
        let batches = build_batches(&tasks, 4);
        let mut seen: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.tasks.iter().map(|t| t.number))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn no_parallel_batch_has_overlapping_files() {
        let tasks = vec![
            task(1, &["a.rs", "b.rs"]),
            task(2, &["b.rs", "c.rs"]),
            task(3, &["d.rs"]),
            task(4, &["c.rs"]),
        ];
        for batch in build_batches(&tasks, 4) {
            if !batch.parallel {
                continue;
            }
            let mut all = BTreeSet::new();
            for t in &batch.tasks {
                for f in &t.files {
                    assert!(all.insert(f.clone()), "file {f} appears twice in a batch");
                }
            }
        }
    }

    #[test]
    fn composition_is_deterministic_in_input_order() {
        let tasks = vec![
            task(1, &["a.rs"]),
            task(2, &["a.rs"]),
            task(3, &["b.rs"]),
        ];
        let first = build_batches(&tasks, 4);
        let second = build_batches(&tasks, 4);
        assert_eq!(first, second);
        // Task 1 grabs task 3 (disjoint); task 2 waits for its own batch.
        assert_eq!(first[0].tasks.len(), 2);
        assert_eq!(first[0].tasks[1].number, 3);
        assert_eq!(first[1].tasks[0].number, 2);
    }
}
