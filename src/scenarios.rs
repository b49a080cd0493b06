//! Built-in step graphs and a matching plant layout.
//!
//! [`parallel_weld_bolt_scenario`] is the reference scenario: one AMR loads
//! two parts, drops them at the welding and bolting stations, and collects
//! them once each job signals completion. Welding and bolting run in
//! parallel with the transport in between. [`inspection_recipe`] shows a
//! decision step routing good parts out and rejects to repair.
//!
//! [`seed_layout`] and [`seed_pallet`] register the locations these graphs
//! refer to, for demos and tests.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::allocation::{AllocationResult, ResourceAllocator};
use crate::constants::defaults;
use crate::graph::{GraphValidationErrors, StepGraph};
use crate::models::{
    ActionType, DecisionBranches, GraphSource, JoinCondition, Location, LocationType, Pallet, PalletId,
    ProductId, StationType, StepDefinition, StepKind, StockUnit,
};

pub const WELDING_STATION: &str = "WeldingStation";
pub const BOLTING_STATION: &str = "BoltingStation";
pub const WAITING_ZONE: &str = "WaitingZone";
pub const CHARGING_STATION: &str = "ChargingStation";
pub const INSPECTION_STATION: &str = "InspectionStation";
pub const REPAIR_AREA: &str = "RepairArea";

/// Loading/unloading zone pair a scenario runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    A,
    B,
}

impl Zone {
    fn suffix(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    pub fn loading(self) -> String {
        format!("LoadingZone{}", self.suffix())
    }

    pub fn unloading(self) -> String {
        format!("UnloadingZone{}", self.suffix())
    }
}

fn transport(n: u32, name: &str, to: impl Into<String>, timeout_seconds: u64) -> StepDefinition {
    StepDefinition::new(n, name, StepKind::Transport, ActionType::Move)
        .at(to)
        .timeout_seconds(timeout_seconds)
}

fn handling(n: u32, name: &str, action: ActionType, at: impl Into<String>) -> StepDefinition {
    StepDefinition::new(n, name, StepKind::Transport, action)
        .at(at)
        .timeout_seconds(180)
}

fn wait_for(n: u32, name: &str, producer: u32, branch: &str, timeout_seconds: u64) -> StepDefinition {
    StepDefinition::new(
        n,
        name,
        StepKind::Wait {
            wait_for_step_number: producer,
        },
        ActionType::WaitForSignal,
    )
    .join(JoinCondition::OnCondition)
    .parallel_id(branch)
    .timeout_seconds(timeout_seconds)
}

/// Parallel welding/bolting scenario (21 steps).
pub fn parallel_weld_bolt_scenario(zone: Zone) -> Result<StepGraph, GraphValidationErrors> {
    let loading = zone.loading();
    let unloading = zone.unloading();

    let steps = vec![
        transport(1, "Move AMR to loading zone", loading.clone(), 300),
        handling(2, "Load first part", ActionType::Load, loading.clone()),
        handling(3, "Load second part", ActionType::Load, loading.clone()),
        transport(4, "Move to welding station", WELDING_STATION, 360).parallel(),
        handling(5, "Unload part onto welding station", ActionType::StationLoad, WELDING_STATION),
        StepDefinition::new(6, "Start welding", StepKind::Process, ActionType::Process)
            .at(WELDING_STATION)
            .station(StationType::WeldingStation)
            .join(JoinCondition::Immediate)
            .parallel()
            .parallel_id("WELD_PROCESS")
            .timeout_seconds(1200)
            .with_parameters(json!({ "equipment_id": "WELD_01", "program": "DEMO_WELD_01" })),
        transport(7, "Move to bolting station", BOLTING_STATION, 360).parallel(),
        handling(8, "Unload part onto bolting station", ActionType::StationLoad, BOLTING_STATION),
        StepDefinition::new(9, "Start bolting", StepKind::Process, ActionType::Process)
            .at(BOLTING_STATION)
            .station(StationType::BoltingStation)
            .join(JoinCondition::Immediate)
            .parallel()
            .parallel_id("BOLT_PROCESS")
            .timeout_seconds(900)
            .with_parameters(json!({ "equipment_id": "BOLT_01", "program": "DEMO_BOLT_01" })),
        transport(10, "Move AMR to waiting zone", WAITING_ZONE, 300),
        wait_for(11, "Wait for welding to finish", 6, "WELD_PROCESS", 1500),
        transport(12, "Return to welding station", WELDING_STATION, 300),
        handling(13, "Pick up welded part", ActionType::StationUnload, WELDING_STATION),
        wait_for(14, "Wait for bolting to finish", 9, "BOLT_PROCESS", 1200),
        transport(15, "Return to bolting station", BOLTING_STATION, 360),
        handling(16, "Pick up bolted part", ActionType::StationUnload, BOLTING_STATION),
        transport(17, "Move to unloading zone", unloading.clone(), 360),
        handling(18, "Unload welded part", ActionType::Unload, unloading.clone()),
        handling(19, "Unload bolted part", ActionType::Unload, unloading.clone()),
        StepDefinition::new(20, "Charge AMR if needed", StepKind::Transport, ActionType::ChargeMove)
            .at(CHARGING_STATION)
            .timeout_seconds(300)
            .skippable()
            .with_parameters(json!({ "min_battery_level": 30 })),
        transport(21, "Return pallet to loading zone", loading, 600).parallel(),
    ];

    StepGraph::new(
        format!("PARALLEL_SCENARIO_{}", zone.suffix()),
        format!("Weld/bolt parallel process (zone {})", zone.suffix()),
        GraphSource::Scenario,
        steps,
    )
}

/// Inspection recipe: inspect, then route to unloading or repair on the
/// inspection result (`step_2.passed`).
pub fn inspection_recipe() -> Result<StepGraph, GraphValidationErrors> {
    let minutes = defaults::RECIPE_STEP_TIMEOUT_MINUTES;
    let steps = vec![
        StepDefinition::new(1, "Move to inspection", StepKind::Transport, ActionType::Move)
            .at(INSPECTION_STATION)
            .timeout_minutes(minutes),
        StepDefinition::new(2, "Inspect part", StepKind::Inspection, ActionType::Inspect)
            .at(INSPECTION_STATION)
            .station(StationType::InspectionStation)
            .timeout_minutes(minutes)
            .with_parameters(json!({ "criteria": { "max_defects": 0 } })),
        StepDefinition::new(
            3,
            "Passed inspection?",
            StepKind::Decision {
                branches: DecisionBranches {
                    when_true: vec![4],
                    when_false: vec![5],
                },
            },
            ActionType::CheckCondition,
        )
        .condition("step_2.passed == true"),
        StepDefinition::new(4, "Ship good part", StepKind::Transport, ActionType::Move)
            .at(Zone::A.unloading())
            .depends_on([3])
            .timeout_minutes(minutes),
        StepDefinition::new(5, "Send to repair", StepKind::Transport, ActionType::Move)
            .at(REPAIR_AREA)
            .depends_on([3])
            .timeout_minutes(minutes),
        StepDefinition::new(6, "Report inspection", StepKind::Notify, ActionType::Notify)
            .depends_on([4, 5])
            .optional()
            .with_parameters(json!({ "message": "Inspection routing finished" })),
    ];
    StepGraph::new("INSPECTION_RECIPE", "Inspect and route", GraphSource::Recipe, steps)
}

/// Register every location the built-in graphs use. Ids start at 1.
pub async fn seed_layout(allocator: &ResourceAllocator, now: DateTime<Utc>) -> AllocationResult<Vec<Location>> {
    let layout = [
        (Zone::A.loading(), LocationType::LoadingZone, 10),
        (Zone::B.loading(), LocationType::LoadingZone, 10),
        (Zone::A.unloading(), LocationType::UnloadingZone, 10),
        (Zone::B.unloading(), LocationType::UnloadingZone, 10),
        (WAITING_ZONE.to_string(), LocationType::WaitingZone, 5),
        (WELDING_STATION.to_string(), LocationType::Station, 1),
        (BOLTING_STATION.to_string(), LocationType::Station, 1),
        (INSPECTION_STATION.to_string(), LocationType::Station, 1),
        (CHARGING_STATION.to_string(), LocationType::Station, 2),
        (REPAIR_AREA.to_string(), LocationType::RepairArea, 5),
    ];

    let mut locations = Vec::with_capacity(layout.len());
    for (id, (code, location_type, capacity)) in (1..).zip(layout) {
        let location = Location::new(id, code, location_type, capacity, now);
        locations.push(allocator.register_location(location).await?);
    }
    Ok(locations)
}

/// Register a two-slot pallet at `location_code` carrying `units` Available
/// units of `product_id`, oldest first.
pub async fn seed_pallet(
    allocator: &ResourceAllocator,
    pallet_id: PalletId,
    location_code: &str,
    product_id: ProductId,
    units: u32,
    now: DateTime<Utc>,
) -> AllocationResult<(Pallet, Vec<StockUnit>)> {
    let location = allocator.location_by_code(location_code).await?;
    let mut pallet = Pallet::new(pallet_id, format!("PLT-{pallet_id:04}"), units.max(2), now);
    pallet.current_location_id = Some(location.id);
    let pallet = allocator.register_pallet(pallet).await?;

    let mut stock = Vec::new();
    for position in 1..=units {
        let inbound_at = now + Duration::seconds(i64::from(position));
        let unit = StockUnit::new(
            format!("STK-{pallet_id:04}-{position:02}"),
            product_id,
            pallet_id,
            position,
            inbound_at,
        );
        stock.push(allocator.register_stock_unit(unit).await?);
    }
    Ok((pallet, stock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_shape() {
        let graph = parallel_weld_bolt_scenario(Zone::A).expect("valid scenario");
        assert_eq!(graph.len(), 21);
        assert_eq!(graph.code, "PARALLEL_SCENARIO_A");

        let parallel: Vec<u32> = graph
            .steps()
            .iter()
            .filter(|step| step.allow_parallel)
            .map(|step| step.step_number)
            .collect();
        assert_eq!(parallel, vec![4, 6, 7, 9, 21]);

        let wait = graph.step(11).expect("step 11");
        assert_eq!(wait.kind, StepKind::Wait { wait_for_step_number: 6 });
        assert_eq!(wait.timeout_seconds, 1500);
        assert!(graph.step(20).expect("step 20").may_be_skipped());
        assert_eq!(graph.mandatory_step_count(), 20);
    }

    #[test]
    fn test_zone_b_uses_its_own_zones() {
        let graph = parallel_weld_bolt_scenario(Zone::B).expect("valid scenario");
        assert_eq!(graph.step(1).and_then(|s| s.target_location.clone()), Some("LoadingZoneB".to_string()));
        assert_eq!(graph.step(17).and_then(|s| s.target_location.clone()), Some("UnloadingZoneB".to_string()));
    }

    #[test]
    fn test_inspection_recipe_branches() {
        let graph = inspection_recipe().expect("valid recipe");
        let decision = graph.step(3).expect("decision");
        assert_eq!(graph.untaken_branch(decision, true), vec![5]);
        assert_eq!(graph.untaken_branch(decision, false), vec![4]);
        assert_eq!(graph.predecessors(6), vec![4, 5]);
    }
}
