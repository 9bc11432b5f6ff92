//! Worker scaling decisions.
//!
//! [`plan`] is a pure function of a snapshot so every rule can be tested without running
//! queues; the lead applies its actions on each steady-state tick.

use std::time::Duration;

use crate::config::{QueueStartConfig, ScalingConfig};
use crate::types::QueueType;

/// What the lead knows about one child when planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSnapshot {
    pub number: i32,
    pub queue_type: QueueType,
    pub depth: usize,
    /// `None` while the child has queued or running work.
    pub idle_for: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    Spawn(QueueType),
    Shutdown { queue_type: QueueType, number: i32 },
}

/// Scaling actions for one tick.
///
/// Per type, at most one action is taken:
/// * spawn when the lead holds queries of a type that has no child, or when the type is
///   below its `min`,
/// * grow when every child of the type is at least `scale_up_depth` deep,
/// * shut down one child that has been idle past the grace period while more than
///   `max(1, min)` children of the type exist.
///
/// Spawns never push the total past `max_child_queues` or a type past its `max`.
#[must_use]
pub fn plan(
    queues: &QueueStartConfig,
    scaling: &ScalingConfig,
    held: [usize; 4],
    children: &[ChildSnapshot],
    max_child_queues: usize,
) -> Vec<ScalingAction> {
    let grace = Duration::from_secs(scaling.idle_grace_secs);
    let mut total = children.len();
    let mut actions = Vec::new();

    for queue_type in QueueType::ALL {
        let limits = queues.for_type(queue_type);
        let of_type: Vec<&ChildSnapshot> = children
            .iter()
            .filter(|c| c.queue_type == queue_type)
            .collect();
        let room = total < max_child_queues && of_type.len() < limits.max;

        let needs_first = of_type.is_empty() && held[queue_type.index()] > 0;
        let below_min = of_type.len() < limits.min;
        let saturated = !of_type.is_empty()
            && of_type.iter().all(|c| c.depth >= scaling.scale_up_depth.max(1));
        if room && (needs_first || below_min || saturated) {
            actions.push(ScalingAction::Spawn(queue_type));
            total += 1;
            continue;
        }

        let keep = limits.min.max(1);
        if of_type.len() > keep {
            let idle = of_type
                .iter()
                .filter(|c| c.idle_for.is_some_and(|idle| idle >= grace))
                .max_by_key(|c| c.number);
            if let Some(child) = idle {
                actions.push(ScalingAction::Shutdown {
                    queue_type,
                    number: child.number,
                });
                total -= 1;
            }
        }
    }
    actions
}

/// Lowest queue number, from 1 up, not used by any child.
#[must_use]
pub fn next_queue_number(used: &[i32]) -> i32 {
    (1..).find(|n| !used.contains(n)).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueScaleConfig;

    fn child(number: i32, queue_type: QueueType, depth: usize, idle_secs: Option<u64>) -> ChildSnapshot {
        ChildSnapshot {
            number,
            queue_type,
            depth,
            idle_for: idle_secs.map(Duration::from_secs),
        }
    }

    #[test]
    fn spawns_first_child_for_held_work() {
        let actions = plan(
            &QueueStartConfig::default(),
            &ScalingConfig::default(),
            [0, 2, 0, 1],
            &[],
            8,
        );
        assert_eq!(
            actions,
            vec![
                ScalingAction::Spawn(QueueType::Medium),
                ScalingAction::Spawn(QueueType::Cache)
            ]
        );
    }

    #[test]
    fn never_exceeds_max_child_queues() {
        let actions = plan(
            &QueueStartConfig::default(),
            &ScalingConfig::default(),
            [1, 1, 1, 1],
            &[child(1, QueueType::Slow, 0, None)],
            2,
        );
        assert_eq!(actions, vec![ScalingAction::Spawn(QueueType::Medium)]);

        let none = plan(
            &QueueStartConfig::default(),
            &ScalingConfig::default(),
            [1, 1, 1, 1],
            &[child(1, QueueType::Slow, 0, None), child(2, QueueType::Fast, 0, None)],
            2,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn grows_saturated_types_within_type_max() {
        let scaling = ScalingConfig {
            idle_grace_secs: 60,
            scale_up_depth: 5,
        };
        let busy = [
            child(1, QueueType::Fast, 6, None),
            child(2, QueueType::Fast, 9, None),
        ];
        assert_eq!(
            plan(&QueueStartConfig::default(), &scaling, [0; 4], &busy, 8),
            vec![ScalingAction::Spawn(QueueType::Fast)]
        );

        let mut capped = QueueStartConfig::default();
        capped.fast = QueueScaleConfig { start: 0, min: 0, max: 2 };
        assert!(plan(&capped, &scaling, [0; 4], &busy, 8).is_empty());
    }

    #[test]
    fn retires_idle_children_but_keeps_one() {
        let scaling = ScalingConfig {
            idle_grace_secs: 10,
            scale_up_depth: 5,
        };
        let children = [
            child(1, QueueType::Slow, 0, Some(100)),
            child(3, QueueType::Slow, 0, Some(100)),
            child(2, QueueType::Medium, 0, Some(100)),
        ];
        assert_eq!(
            plan(&QueueStartConfig::default(), &scaling, [0; 4], &children, 8),
            vec![ScalingAction::Shutdown {
                queue_type: QueueType::Slow,
                number: 3
            }]
        );

        let young = [
            child(1, QueueType::Slow, 0, Some(1)),
            child(2, QueueType::Slow, 0, None),
        ];
        assert!(plan(&QueueStartConfig::default(), &scaling, [0; 4], &young, 8).is_empty());

        let mut floor = QueueStartConfig::default();
        floor.slow = QueueScaleConfig { start: 0, min: 2, max: 3 };
        assert!(plan(&floor, &scaling, [0; 4], &children[..2], 8).is_empty());
    }

    #[test]
    fn queue_numbers_fill_gaps() {
        assert_eq!(next_queue_number(&[]), 1);
        assert_eq!(next_queue_number(&[1, 2, 4]), 3);
        assert_eq!(next_queue_number(&[2]), 1);
    }
}
