use std::collections::BTreeMap;

use crate::LoadSharingPriority;

/// Strategy used by power connections that do not name one.
pub const DEFAULT_ALGORITHM: &str = "PriorityLoadSharing";

/// A station asking for a share of a power connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub client_id: String,
    pub priority: LoadSharingPriority,
    /// Cable tier bounded by the configured charge rate limit.
    pub max_amps: u32,
}

impl AllocationRequest {
    pub fn new(client_id: impl Into<String>, priority: LoadSharingPriority, max_amps: u32) -> Self {
        AllocationRequest {
            client_id: client_id.into(),
            priority,
            max_amps,
        }
    }
}

/// Policy dividing a capacity between stations.
///
/// Implementations must never hand out more than `capacity` in total and never
/// authorise a non-zero current below `lowest_charge_rate`.
pub trait AllocationStrategy: Send + Sync {
    fn id(&self) -> &'static str;

    fn allocate(
        &self,
        capacity: u32,
        lowest_charge_rate: u32,
        requests: &[AllocationRequest],
    ) -> BTreeMap<String, u32>;
}

/// HIGH stations are served first, then NORMAL, then LOW; equal shares within a level.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityLoadSharing;

/// Equal shares for everyone, priorities ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualShare;

pub fn strategy_by_id(id: &str) -> Option<&'static dyn AllocationStrategy> {
    match id {
        "PriorityLoadSharing" => Some(&PriorityLoadSharing),
        "EqualShare" => Some(&EqualShare),
        _ => None,
    }
}

impl AllocationStrategy for PriorityLoadSharing {
    fn id(&self) -> &'static str {
        "PriorityLoadSharing"
    }

    fn allocate(
        &self,
        capacity: u32,
        lowest_charge_rate: u32,
        requests: &[AllocationRequest],
    ) -> BTreeMap<String, u32> {
        let levels = [
            LoadSharingPriority::High,
            LoadSharingPriority::Normal,
            LoadSharingPriority::Low,
        ]
        .map(|priority| {
            let mut level: Vec<&AllocationRequest> = requests
                .iter()
                .filter(|request| request.priority == priority)
                .collect();
            level.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            level
        });
        share_by_levels(capacity, lowest_charge_rate, &levels)
    }
}

impl AllocationStrategy for EqualShare {
    fn id(&self) -> &'static str {
        "EqualShare"
    }

    fn allocate(
        &self,
        capacity: u32,
        lowest_charge_rate: u32,
        requests: &[AllocationRequest],
    ) -> BTreeMap<String, u32> {
        let mut level: Vec<&AllocationRequest> = requests.iter().collect();
        level.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        share_by_levels(capacity, lowest_charge_rate, &[level])
    }
}

fn share_by_levels(
    capacity: u32,
    lowest_charge_rate: u32,
    levels: &[Vec<&AllocationRequest>],
) -> BTreeMap<String, u32> {
    let mut allocation: BTreeMap<String, u32> = levels
        .iter()
        .flatten()
        .map(|request| (request.client_id.clone(), 0))
        .collect();
    let mut remaining = capacity;

    // First pass: split what is left between the stations of each level in turn
    for level in levels.iter().filter(|level| !level.is_empty()) {
        let share = remaining / level.len() as u32;
        for request in level {
            let mut amps = share.min(request.max_amps).min(remaining);
            if amps < lowest_charge_rate {
                amps = if request.max_amps >= lowest_charge_rate && remaining >= lowest_charge_rate
                {
                    lowest_charge_rate
                } else {
                    0
                };
            }
            remaining -= amps;
            allocation.insert(request.client_id.clone(), amps);
        }
    }

    // Then top up stations that can still take more, level by level, until
    // nothing moves anymore
    loop {
        let mut progressed = false;
        for level in levels {
            if remaining == 0 {
                break;
            }
            let wanting: Vec<&&AllocationRequest> = level
                .iter()
                .filter(|request| {
                    request.max_amps >= lowest_charge_rate
                        && allocation[&request.client_id] < request.max_amps
                })
                .collect();
            if wanting.is_empty() {
                continue;
            }
            let share = (remaining / wanting.len() as u32).max(1);
            for request in wanting {
                let current = allocation[&request.client_id];
                let mut extra = share.min(request.max_amps - current).min(remaining);
                if current == 0 && extra < lowest_charge_rate {
                    if remaining < lowest_charge_rate {
                        continue;
                    }
                    extra = lowest_charge_rate;
                }
                if extra == 0 {
                    continue;
                }
                allocation.insert(request.client_id.clone(), current + extra);
                remaining -= extra;
                progressed = true;
            }
        }
        if !progressed || remaining == 0 {
            break;
        }
    }

    allocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoadSharingPriority::{High, Low, Normal};

    fn allocated(allocation: &BTreeMap<String, u32>, client_id: &str) -> u32 {
        *allocation
            .get(client_id)
            .expect("Could not find station in allocation")
    }

    fn total(allocation: &BTreeMap<String, u32>) -> u32 {
        allocation.values().sum()
    }

    #[test]
    /// Low capacity available, no station at its maximum
    fn test_equal_split() {
        let requests = vec![
            AllocationRequest::new("a", Normal, 32),
            AllocationRequest::new("b", Normal, 32),
        ];
        let allocation = PriorityLoadSharing.allocate(32, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 16);
        assert_eq!(allocated(&allocation, "b"), 16);
    }

    #[test]
    /// One station limited, the rest of its share goes to the other one
    fn test_partial_max() {
        let requests = vec![
            AllocationRequest::new("a", Normal, 10),
            AllocationRequest::new("b", Normal, 32),
        ];
        let allocation = PriorityLoadSharing.allocate(32, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 10);
        assert_eq!(allocated(&allocation, "b"), 22);
    }

    #[test]
    /// High capacity available, every station at its maximum
    fn test_all_max_remaining() {
        let requests = vec![
            AllocationRequest::new("a", Normal, 13),
            AllocationRequest::new("b", Low, 20),
        ];
        let allocation = PriorityLoadSharing.allocate(100, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 13);
        assert_eq!(allocated(&allocation, "b"), 20);
    }

    #[test]
    fn test_odd_remainder_is_handed_out() {
        let requests = vec![
            AllocationRequest::new("a", Normal, 32),
            AllocationRequest::new("b", Normal, 32),
        ];
        let allocation = PriorityLoadSharing.allocate(33, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 17);
        assert_eq!(allocated(&allocation, "b"), 16);
    }

    #[test]
    fn test_high_priority_served_first() {
        let requests = vec![
            AllocationRequest::new("garage", Normal, 32),
            AllocationRequest::new("visitor", Low, 32),
            AllocationRequest::new("work-van", High, 20),
        ];
        let allocation = PriorityLoadSharing.allocate(32, 6, &requests);
        assert_eq!(allocated(&allocation, "work-van"), 20);
        assert_eq!(allocated(&allocation, "garage"), 12);
        assert_eq!(allocated(&allocation, "visitor"), 0);
    }

    #[test]
    fn test_equal_share_ignores_priority() {
        let requests = vec![
            AllocationRequest::new("garage", Normal, 32),
            AllocationRequest::new("work-van", High, 32),
        ];
        let allocation = EqualShare.allocate(32, 6, &requests);
        assert_eq!(allocated(&allocation, "garage"), 16);
        assert_eq!(allocated(&allocation, "work-van"), 16);
    }

    #[test]
    fn test_never_below_lowest_charge_rate() {
        let requests = vec![
            AllocationRequest::new("a", Normal, 32),
            AllocationRequest::new("b", Normal, 32),
            AllocationRequest::new("c", Normal, 32),
        ];
        let allocation = PriorityLoadSharing.allocate(10, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 10);
        assert_eq!(allocated(&allocation, "b"), 0);
        assert_eq!(allocated(&allocation, "c"), 0);

        let allocation = PriorityLoadSharing.allocate(13, 6, &requests);
        assert_eq!(allocated(&allocation, "a"), 7);
        assert_eq!(allocated(&allocation, "b"), 6);
        assert_eq!(allocated(&allocation, "c"), 0);
    }

    #[test]
    fn test_station_below_lowest_gets_nothing() {
        let requests = vec![
            AllocationRequest::new("no-cable", Normal, 0),
            AllocationRequest::new("b", Normal, 32),
        ];
        let allocation = PriorityLoadSharing.allocate(32, 6, &requests);
        assert_eq!(allocated(&allocation, "no-cable"), 0);
        assert_eq!(allocated(&allocation, "b"), 32);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let priorities = [High, Normal, Low];
        let maxima = [0, 6, 13, 20, 32];
        for capacity in 0..=70 {
            for count in 1..=6usize {
                let requests: Vec<AllocationRequest> = (0..count)
                    .map(|i| {
                        AllocationRequest::new(
                            format!("s{i}"),
                            priorities[i % priorities.len()],
                            maxima[i % maxima.len()],
                        )
                    })
                    .collect();
                for strategy in [&PriorityLoadSharing as &dyn AllocationStrategy, &EqualShare] {
                    let allocation = strategy.allocate(capacity, 6, &requests);
                    assert!(total(&allocation) <= capacity, "capacity={capacity} count={count}");
                    for request in &requests {
                        let amps = allocated(&allocation, &request.client_id);
                        assert!(amps <= request.max_amps);
                        assert!(amps == 0 || amps >= 6);
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_requests() {
        assert!(PriorityLoadSharing.allocate(32, 6, &[]).is_empty());
    }

    #[test]
    fn test_strategy_lookup() {
        assert_eq!(
            strategy_by_id(DEFAULT_ALGORITHM).map(|strategy| strategy.id()),
            Some("PriorityLoadSharing")
        );
        assert_eq!(
            strategy_by_id("EqualShare").map(|strategy| strategy.id()),
            Some("EqualShare")
        );
        assert!(strategy_by_id("RoundRobin").is_none());
    }
}
