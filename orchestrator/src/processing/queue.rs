use std::collections::{BTreeMap, VecDeque};

use shared::types::{Stage, WorkItem};

/// One FIFO per stage. No reordering happens inside a stage.
#[derive(Debug, Default)]
pub struct StageQueues {
    queues: BTreeMap<Stage, VecDeque<WorkItem>>,
}

impl StageQueues {
    pub fn push(&mut self, stage: Stage, item: WorkItem) {
        self.queues.entry(stage).or_default().push_back(item);
    }

    /// Put an item back at the head, used when it could not be delivered
    pub fn push_front(&mut self, stage: Stage, item: WorkItem) {
        self.queues.entry(stage).or_default().push_front(item);
    }

    pub fn pop(&mut self, stage: Stage) -> Option<WorkItem> {
        self.queues.get_mut(&stage)?.pop_front()
    }

    pub fn is_empty(&self, stage: Stage) -> bool {
        self.len(stage) == 0
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.queues.get(&stage).map_or(0, VecDeque::len)
    }

    pub fn lengths(&self) -> BTreeMap<Stage, usize> {
        Stage::ALL.iter().map(|s| (*s, self.len(*s))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_per_stage() {
        let mut queues = StageQueues::default();
        queues.push(Stage::Pre, WorkItem::for_analysis("a", "/a"));
        queues.push(Stage::Identification, WorkItem::for_analysis("x", "/x"));
        queues.push(Stage::Pre, WorkItem::for_analysis("b", "/b"));

        assert_eq!(queues.pop(Stage::Pre).unwrap().analysis_id, "a");
        queues.push_front(Stage::Pre, WorkItem::for_analysis("c", "/c"));
        assert_eq!(queues.pop(Stage::Pre).unwrap().analysis_id, "c");
        assert_eq!(queues.pop(Stage::Pre).unwrap().analysis_id, "b");
        assert!(queues.pop(Stage::Pre).is_none());
        assert!(queues.pop(Stage::Post).is_none());
        assert_eq!(queues.len(Stage::Identification), 1);
    }
}
