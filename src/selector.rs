//! Configuration space & applicability
//!
//! The selector is a pure function from a [`Configuration`] — the allowed
//! containers, traversals, layouts, Newton-3 modes and cell-size factors —
//! to concrete [`TraversalPlan`]s that pass **static applicability**: the
//! container/traversal compatibility table, the per-traversal layout and
//! Newton-3 constraints, and the device rule (cuda tags are recognized but
//! never applicable, there is no device). It performs no I/O and holds no
//! state; dynamic feasibility (grid shapes, functor capabilities) is checked
//! again by the executing container.
//!
//! Unrecognized tags surface as [`SelectorError::UnknownOption`], both from
//! string parsing and from JSON configuration input.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::functor::DataLayout;
use crate::traversal::TraversalKind;
use crate::Real;

/// Canonical container tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Two cells, all pairs, no spatial index.
    #[serde(rename = "directSum")]
    DirectSum,
    /// Cell grid with coloring/slicing traversals.
    #[serde(rename = "linkedCells")]
    LinkedCells,
    /// Per-particle neighbor lists over a slot arena.
    #[serde(rename = "verletLists")]
    VerletLists,
    /// Cell-anchored neighbor lists.
    #[serde(rename = "verletListsCells")]
    VerletListsCells,
    /// Tower grid with fixed-size clusters.
    #[serde(rename = "verletClusterLists")]
    VerletClusterLists,
}

impl ContainerKind {
    /// Stable tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::DirectSum => "directSum",
            ContainerKind::LinkedCells => "linkedCells",
            ContainerKind::VerletLists => "verletLists",
            ContainerKind::VerletListsCells => "verletListsCells",
            ContainerKind::VerletClusterLists => "verletClusterLists",
        }
    }

    /// Every recognized tag.
    pub fn all() -> &'static [ContainerKind] {
        &[
            ContainerKind::DirectSum,
            ContainerKind::LinkedCells,
            ContainerKind::VerletLists,
            ContainerKind::VerletListsCells,
            ContainerKind::VerletClusterLists,
        ]
    }

    /// Traversals this container can execute at all.
    pub fn compatible_traversals(&self) -> &'static [TraversalKind] {
        match self {
            ContainerKind::DirectSum => &[TraversalKind::DirectSum],
            ContainerKind::LinkedCells => &[
                TraversalKind::C01,
                TraversalKind::C04,
                TraversalKind::C04Soa,
                TraversalKind::C08,
                TraversalKind::C18,
                TraversalKind::Sliced,
                TraversalKind::C01Cuda,
            ],
            ContainerKind::VerletLists => {
                &[TraversalKind::Verlet, TraversalKind::VarVerletAsBuild]
            }
            ContainerKind::VerletListsCells => &[
                TraversalKind::C01Verlet,
                TraversalKind::C18Verlet,
                TraversalKind::SlicedVerlet,
            ],
            ContainerKind::VerletClusterLists => &[
                TraversalKind::VerletClusters,
                TraversalKind::VerletClustersColoring,
            ],
        }
    }
}

/// Newton-3 configuration axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Newton3Mode {
    /// Exploit reciprocity: each pair visited once.
    #[serde(rename = "enabled")]
    Enabled,
    /// No reciprocity: each pair visited once per ordering.
    #[serde(rename = "disabled")]
    Disabled,
}

impl Newton3Mode {
    /// Stable tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Newton3Mode::Enabled => "enabled",
            Newton3Mode::Disabled => "disabled",
        }
    }

    /// As the boolean the traversals consume.
    pub fn as_bool(&self) -> bool {
        matches!(self, Newton3Mode::Enabled)
    }
}

/// Errors surfaced by the selector.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// A tag (string or JSON) did not parse to a known option.
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    /// The requested combination fails static applicability.
    #[error("combination not applicable: {0}")]
    TraversalNotApplicable(String),
}

impl FromStr for ContainerKind {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, SelectorError> {
        ContainerKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| SelectorError::UnknownOption(s.into()))
    }
}

impl FromStr for TraversalKind {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, SelectorError> {
        TraversalKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| SelectorError::UnknownOption(s.into()))
    }
}

impl FromStr for DataLayout {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, SelectorError> {
        [DataLayout::Aos, DataLayout::Soa, DataLayout::Cuda]
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| SelectorError::UnknownOption(s.into()))
    }
}

impl FromStr for Newton3Mode {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, SelectorError> {
        match s {
            "enabled" => Ok(Newton3Mode::Enabled),
            "disabled" => Ok(Newton3Mode::Disabled),
            _ => Err(SelectorError::UnknownOption(s.into())),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// The option space the driver allows the engine to pick from, plus the
/// list parameters every Verlet container consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Containers the tuner may instantiate.
    pub allowed_containers: Vec<ContainerKind>,
    /// Traversals the tuner may run.
    pub allowed_traversals: Vec<TraversalKind>,
    /// Data layouts the tuner may drive functors in.
    pub allowed_data_layouts: Vec<DataLayout>,
    /// Newton-3 modes the tuner may use.
    pub allowed_newton3: Vec<Newton3Mode>,
    /// Cell-size factors (finite set).
    pub allowed_cell_size_factors: Vec<Real>,
    /// Verlet skin radius.
    pub verlet_skin: Real,
    /// Verlet rebuild frequency (steps).
    pub verlet_rebuild_frequency: usize,
    /// Samples per configuration during tuning.
    pub num_samples: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            allowed_containers: ContainerKind::all().to_vec(),
            allowed_traversals: TraversalKind::all().to_vec(),
            allowed_data_layouts: vec![DataLayout::Aos, DataLayout::Soa],
            allowed_newton3: vec![Newton3Mode::Enabled, Newton3Mode::Disabled],
            allowed_cell_size_factors: vec![1.0],
            verlet_skin: 0.2,
            verlet_rebuild_frequency: 20,
            num_samples: 3,
        }
    }
}

impl Configuration {
    /// Parse a configuration from JSON; unknown tags are `UnknownOption`.
    pub fn from_json(s: &str) -> Result<Self, SelectorError> {
        serde_json::from_str(s).map_err(|e| SelectorError::UnknownOption(e.to_string()))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("configuration serializes")
    }
}

/// One fully resolved combination, ready for a container to execute.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraversalPlan {
    /// Which container executes the step.
    pub container: ContainerKind,
    /// Which traversal scheme runs.
    pub traversal: TraversalKind,
    /// The data layout the functor is driven in.
    pub layout: DataLayout,
    /// Whether Newton-3 reciprocity is exploited.
    pub newton3: bool,
    /// Cell-size factor for grid-based containers.
    pub cell_size_factor: Real,
}

// ============================================================================
// Static applicability
// ============================================================================

/// Layouts a traversal can drive at all (device layouts stay listed even
/// though the device rule rejects them later, so the error is precise).
fn supported_layouts(traversal: TraversalKind) -> &'static [DataLayout] {
    match traversal {
        TraversalKind::DirectSum
        | TraversalKind::C01
        | TraversalKind::C04
        | TraversalKind::C08
        | TraversalKind::C18
        | TraversalKind::Sliced
        | TraversalKind::Verlet => &[DataLayout::Aos, DataLayout::Soa],
        TraversalKind::C04Soa => &[DataLayout::Soa],
        TraversalKind::C01Verlet
        | TraversalKind::C18Verlet
        | TraversalKind::SlicedVerlet
        | TraversalKind::VarVerletAsBuild
        | TraversalKind::VerletClusters
        | TraversalKind::VerletClustersColoring => &[DataLayout::Aos],
        TraversalKind::C01Cuda => &[DataLayout::Cuda],
    }
}

/// Traversals that forfeit Newton-3 by construction.
fn requires_no_newton3(traversal: TraversalKind) -> bool {
    matches!(
        traversal,
        TraversalKind::C01
            | TraversalKind::C01Verlet
            | TraversalKind::VerletClusters
            | TraversalKind::C01Cuda
    )
}

/// Static applicability of one combination.
pub fn check_applicability(plan: &TraversalPlan) -> Result<(), SelectorError> {
    let fail = |reason: String| Err(SelectorError::TraversalNotApplicable(reason));
    if !plan.container.compatible_traversals().contains(&plan.traversal) {
        return fail(format!(
            "container {} cannot run traversal {}",
            plan.container.as_str(),
            plan.traversal.as_str()
        ));
    }
    if plan.layout == DataLayout::Cuda || plan.traversal == TraversalKind::C01Cuda {
        return fail("no cuda device available".into());
    }
    if !supported_layouts(plan.traversal).contains(&plan.layout) {
        return fail(format!(
            "traversal {} does not support layout {}",
            plan.traversal.as_str(),
            plan.layout.as_str()
        ));
    }
    if plan.newton3 && requires_no_newton3(plan.traversal) {
        return fail(format!(
            "traversal {} cannot exploit newton3",
            plan.traversal.as_str()
        ));
    }
    if !(plan.cell_size_factor > 0.0) {
        return fail(format!("cell size factor {} is not positive", plan.cell_size_factor));
    }
    Ok(())
}

/// Enumerate every applicable plan of the configuration, in deterministic
/// order (containers, then traversals, layouts, Newton-3 modes, factors).
pub fn select(config: &Configuration) -> Vec<TraversalPlan> {
    let mut plans = Vec::new();
    for &container in &config.allowed_containers {
        for &traversal in &config.allowed_traversals {
            for &layout in &config.allowed_data_layouts {
                for &n3 in &config.allowed_newton3 {
                    for &csf in &config.allowed_cell_size_factors {
                        let plan = TraversalPlan {
                            container,
                            traversal,
                            layout,
                            newton3: n3.as_bool(),
                            cell_size_factor: csf,
                        };
                        if check_applicability(&plan).is_ok() {
                            plans.push(plan);
                        }
                    }
                }
            }
        }
    }
    tracing::trace!(candidates = plans.len(), "enumerated applicable configurations");
    plans
}

/// The first applicable plan, or `TraversalNotApplicable` when the allowed
/// sets admit none.
pub fn first_applicable(config: &Configuration) -> Result<TraversalPlan, SelectorError> {
    select(config).into_iter().next().ok_or_else(|| {
        SelectorError::TraversalNotApplicable("no allowed combination is applicable".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_from_str() {
        for k in ContainerKind::all() {
            assert_eq!(ContainerKind::from_str(k.as_str()).unwrap(), *k);
        }
        for k in TraversalKind::all() {
            assert_eq!(TraversalKind::from_str(k.as_str()).unwrap(), *k);
        }
        assert!(matches!(
            ContainerKind::from_str("octree"),
            Err(SelectorError::UnknownOption(_))
        ));
    }

    #[test]
    fn cuda_tags_are_recognized_but_never_applicable() {
        assert!(TraversalKind::from_str("c01Cuda").is_ok());
        let plan = TraversalPlan {
            container: ContainerKind::LinkedCells,
            traversal: TraversalKind::C01Cuda,
            layout: DataLayout::Cuda,
            newton3: false,
            cell_size_factor: 1.0,
        };
        assert!(matches!(
            check_applicability(&plan),
            Err(SelectorError::TraversalNotApplicable(_))
        ));
    }

    #[test]
    fn c01_requires_no_newton3_and_c04soa_requires_soa() {
        let mut plan = TraversalPlan {
            container: ContainerKind::LinkedCells,
            traversal: TraversalKind::C01,
            layout: DataLayout::Aos,
            newton3: true,
            cell_size_factor: 1.0,
        };
        assert!(check_applicability(&plan).is_err());
        plan.newton3 = false;
        assert!(check_applicability(&plan).is_ok());

        plan.traversal = TraversalKind::C04Soa;
        assert!(check_applicability(&plan).is_err());
        plan.layout = DataLayout::Soa;
        plan.newton3 = true;
        assert!(check_applicability(&plan).is_ok());
    }

    #[test]
    fn container_traversal_table_is_enforced() {
        let plan = TraversalPlan {
            container: ContainerKind::DirectSum,
            traversal: TraversalKind::C08,
            layout: DataLayout::Aos,
            newton3: true,
            cell_size_factor: 1.0,
        };
        assert!(check_applicability(&plan).is_err());
    }

    #[test]
    fn default_configuration_yields_plans_for_every_container() {
        let plans = select(&Configuration::default());
        for container in ContainerKind::all() {
            assert!(
                plans.iter().any(|p| p.container == *container),
                "no plan for {container:?}"
            );
        }
        // Nothing cuda survives.
        assert!(plans
            .iter()
            .all(|p| p.layout != DataLayout::Cuda && p.traversal != TraversalKind::C01Cuda));
        assert!(first_applicable(&Configuration::default()).is_ok());
    }

    #[test]
    fn configuration_round_trips_through_json() {
        let config = Configuration::default();
        let parsed = Configuration::from_json(&config.to_json()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn unknown_json_tags_are_unknown_options() {
        let json = r#"{
            "allowed_containers": ["octree"],
            "allowed_traversals": ["c08"],
            "allowed_data_layouts": ["aos"],
            "allowed_newton3": ["enabled"],
            "allowed_cell_size_factors": [1.0],
            "verlet_skin": 0.2,
            "verlet_rebuild_frequency": 20,
            "num_samples": 3
        }"#;
        assert!(matches!(
            Configuration::from_json(json),
            Err(SelectorError::UnknownOption(_))
        ));
    }
}
