//! Running workloads, as read for cost estimation.

use crate::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub phase: PodPhase,
}

impl Pod {
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ContainerResources,
}

impl Container {
    /// Container requesting `cpu` and `memory` (quantity strings)
    pub fn with_requests(
        name: impl Into<String>,
        cpu: impl Into<String>,
        memory: impl Into<String>,
    ) -> Self {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), cpu.into());
        requests.insert("memory".to_string(), memory.into());
        Self {
            name: name.into(),
            resources: ContainerResources {
                requests,
                limits: BTreeMap::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}
