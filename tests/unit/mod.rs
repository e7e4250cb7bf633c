//! Unit tests for vmss-operator.
//!
//! These tests run without a Kubernetes cluster or Azure access and test
//! individual components in isolation.

mod crd_tests {
    use vmss_operator::crd::{
        AzureCluster, AzureClusterSpec, AzureClusterStatus, CONDITION_CREATED, Condition,
        ControlPlaneSpec, ReleaseSpec, SecretReference, find_condition, is_condition_true,
        upsert_condition,
    };

    fn cluster(resource_group: Option<&str>) -> AzureCluster {
        AzureCluster::new(
            "c7",
            AzureClusterSpec {
                location: "westeurope".to_string(),
                resource_group: resource_group.map(str::to_string),
                credential_secret: SecretReference {
                    name: "azure-sp".to_string(),
                    namespace: None,
                },
                release: ReleaseSpec::default(),
                control_plane: ControlPlaneSpec {
                    vm_size: "Standard_D4s_v5".to_string(),
                    replicas: 1,
                    availability_zones: Vec::new(),
                    storage_account_type: None,
                },
            },
        )
    }

    #[test]
    fn test_condition_new_boolean_status() {
        let condition = Condition::new("Created", true, "CreationCompleted", "done", Some(2));
        assert_eq!(condition.r#type, "Created");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "CreationCompleted");
        assert_eq!(condition.observed_generation, Some(2));

        let condition = Condition::new("Created", false, "", "", None);
        assert_eq!(condition.status, "False");
    }

    #[test]
    fn test_stage_condition_carries_state_label() {
        let condition = Condition::stage("DeploymentInitialized");
        assert_eq!(condition.r#type, "Stage");
        assert_eq!(condition.status, "DeploymentInitialized");
    }

    #[test]
    fn test_find_and_is_condition_true() {
        let conditions = vec![
            Condition::new("Created", true, "", "", None),
            Condition::stage("DeploymentCompleted"),
        ];
        assert!(find_condition(&conditions, "Stage").is_some());
        assert!(find_condition(&conditions, "Ready").is_none());
        assert!(is_condition_true(&conditions, CONDITION_CREATED));
        // A Stage condition is never "True".
        assert!(!is_condition_true(&conditions, "Stage"));
    }

    #[test]
    fn test_upsert_condition_replaces_in_place() {
        let mut conditions = vec![
            Condition::stage("DeploymentUninitialized"),
            Condition::new("Created", true, "", "", None),
        ];
        upsert_condition(&mut conditions, Condition::stage("DeploymentInitialized"));
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].status, "DeploymentInitialized");

        upsert_condition(&mut conditions, Condition::ready(true, "", "", None));
        assert_eq!(conditions.len(), 3);
    }

    #[test]
    fn test_resource_group_falls_back_to_name() {
        assert_eq!(cluster(None).resource_group(), "c7");
        assert_eq!(cluster(Some("rg-custom")).resource_group(), "rg-custom");
    }

    #[test]
    fn test_creation_complete_requires_created_condition() {
        let mut c = cluster(None);
        assert!(!c.creation_complete());

        c.status = Some(AzureClusterStatus {
            conditions: vec![Condition::new("Created", true, "", "", None)],
            ..Default::default()
        });
        assert!(c.creation_complete());
    }
}

mod status_tests {
    use vmss_operator::controller::status::{stage_of, upgrade_state_of};
    use vmss_operator::crd::{
        AzureNodePool, AzureNodePoolSpec, OsImageSpec, ReleaseSpec, ScalingSpec,
        UPGRADE_STATE_ANNOTATION,
    };

    fn pool() -> AzureNodePool {
        AzureNodePool::new(
            "np1",
            AzureNodePoolSpec {
                cluster_name: "c7".to_string(),
                vm_size: "Standard_D8s_v5".to_string(),
                subnet: "workers".to_string(),
                os_image: OsImageSpec {
                    version: "3815.2.5".to_string(),
                },
                release: ReleaseSpec::default(),
                scaling: ScalingSpec { min: 1, max: 10 },
                spot: None,
                accelerated_networking: None,
            },
        )
    }

    #[test]
    fn test_stage_of_cluster_without_status_is_empty() {
        let cluster = crate::bare_cluster();
        assert!(stage_of(&cluster).is_empty());
    }

    #[test]
    fn test_upgrade_state_of_unannotated_pool_is_none() {
        assert!(upgrade_state_of(&pool()).is_none());
    }

    #[test]
    fn test_upgrade_state_of_reads_annotation() {
        let mut pool = pool();
        pool.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                UPGRADE_STATE_ANNOTATION.to_string(),
                "ScaleUpWorkerVMSS".to_string(),
            );
        let state = upgrade_state_of(&pool).expect("annotation set");
        assert_eq!(state.as_str(), "ScaleUpWorkerVMSS");
    }
}

mod naming_tests {
    use vmss_operator::azure::types::ResourceScope;

    #[test]
    fn test_azure_resource_names_derive_from_scope() {
        let scope = ResourceScope::new("c7", "rg-c7");
        assert_eq!(scope.masters_scale_set(), "c7-masters");
        assert_eq!(scope.masters_deployment(), "masters");
        assert_eq!(scope.node_pool_scale_set("np1"), "c7-worker-np1");
        assert_eq!(scope.node_pool_deployment("np1"), "nodepool-np1");
    }
}

mod template_tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use vmss_operator::azure::types::Deployment;
    use vmss_operator::template::{
        DesiredDeployment, PARAM_SCALING, diff, is_scaling_only,
    };

    fn desired(parameters: &[(&str, serde_json::Value)]) -> DesiredDeployment {
        DesiredDeployment {
            template: json!({"kind": "test"}),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn applied(parameters: &[(&str, serde_json::Value)]) -> Deployment {
        Deployment {
            name: "test".to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_diff_ignores_untracked_parameters() {
        let current = applied(&[("vmSize", json!("a")), ("extra", json!(1))]);
        let wanted = desired(&[("vmSize", json!("a")), ("extra", json!(2))]);
        assert!(diff(&current, &wanted).is_empty());
    }

    #[test]
    fn test_diff_treats_missing_parameter_as_changed() {
        let current = applied(&[]);
        let wanted = desired(&[("vmSize", json!("Standard_D8s_v5"))]);
        assert_eq!(diff(&current, &wanted), vec!["vmSize".to_string()]);
    }

    #[test]
    fn test_scaling_only_classification() {
        assert!(is_scaling_only(&[PARAM_SCALING.to_string()]));
        assert!(!is_scaling_only(&[
            PARAM_SCALING.to_string(),
            "vmSize".to_string()
        ]));
        assert!(!is_scaling_only(&[]));
    }

    #[test]
    fn test_checksums_are_stable_and_content_sensitive() {
        let a = desired(&[("vmSize", json!("a"))]);
        let b = desired(&[("vmSize", json!("a"))]);
        let c = desired(&[("vmSize", json!("b"))]);
        assert_eq!(a.parameters_checksum(), b.parameters_checksum());
        assert_ne!(a.parameters_checksum(), c.parameters_checksum());
        assert_eq!(a.template_checksum(), c.template_checksum());
    }
}

mod state_label_tests {
    use vmss_operator::controller::masters::{MasterState, control_plane_upgrading};
    use vmss_operator::controller::node_pool::NodePoolState;
    use vmss_operator::controller::state_machine::State;

    #[test]
    fn test_master_state_labels_are_distinct() {
        let mut labels: Vec<&str> = MasterState::ALL.iter().map(|s| s.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), MasterState::ALL.len());
    }

    #[test]
    fn test_node_pool_state_labels_are_distinct() {
        let mut labels: Vec<&str> = NodePoolState::ALL.iter().map(|s| s.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), NodePoolState::ALL.len());
    }

    #[test]
    fn test_node_pool_pauses_for_every_masters_state_but_rest() {
        for state in MasterState::ALL {
            let paused = control_plane_upgrading(&State::from(state.label()));
            let expected = !matches!(state, MasterState::Empty | MasterState::DeploymentCompleted);
            assert_eq!(paused, expected, "state: {state:?}");
        }
    }
}

mod upgrade_detection_tests {
    use std::collections::BTreeMap;

    use vmss_operator::crd::ReleaseSpec;
    use vmss_operator::workload::{COMPONENT_LABEL_PREFIX, WorkloadNode, node_requires_upgrade};

    fn release(components: &[(&str, &str)]) -> ReleaseSpec {
        ReleaseSpec {
            version: "18.2.1".to_string(),
            components: components
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn node(components: &[(&str, &str)]) -> WorkloadNode {
        WorkloadNode {
            name: "w0".to_string(),
            ready: true,
            labels: components
                .iter()
                .map(|(k, v)| (format!("{COMPONENT_LABEL_PREFIX}{k}"), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_matching_versions_do_not_require_upgrade() {
        let release = release(&[("kubernetes", "1.32.2"), ("flatcar", "3815.2.5")]);
        let node = node(&[("kubernetes", "1.32.2"), ("flatcar", "3815.2.5")]);
        assert!(!node_requires_upgrade(&node, &release));
    }

    #[test]
    fn test_any_outdated_component_requires_upgrade() {
        let release = release(&[("kubernetes", "1.32.2"), ("flatcar", "3815.2.5")]);
        let node = node(&[("kubernetes", "1.32.2"), ("flatcar", "3815.2.4")]);
        assert!(node_requires_upgrade(&node, &release));
    }

    #[test]
    fn test_missing_component_label_requires_upgrade() {
        let release = release(&[("kubernetes", "1.32.2")]);
        let node = node(&[]);
        assert!(node_requires_upgrade(&node, &release));
    }

    #[test]
    fn test_unparseable_versions_fall_back_to_string_comparison() {
        // A leading "v" is not valid semver, so plain string equality decides.
        let release = release(&[("containerd", "v2.0")]);
        let current = node(&[("containerd", "v2.0")]);
        assert!(!node_requires_upgrade(&current, &release));

        let outdated = node(&[("containerd", "v1.7")]);
        assert!(node_requires_upgrade(&outdated, &release));
    }
}

mod scale_tests {
    use vmss_operator::controller::scale::{MAX_SCALE_UP_STEP, next_count};

    #[test]
    fn test_scale_up_converges_in_bounded_steps() {
        let mut current = 3;
        let desired = 20;
        let mut ticks = 0;
        while current != desired {
            let next = next_count(current, desired);
            assert!(next > current);
            assert!(next - current <= MAX_SCALE_UP_STEP);
            current = next;
            ticks += 1;
        }
        assert_eq!(ticks, 4);
    }

    #[test]
    fn test_scale_down_and_noop() {
        assert_eq!(next_count(20, 8), 8);
        assert_eq!(next_count(8, 8), 8);
    }
}

/// Minimal cluster without any status, shared by the test modules above.
fn bare_cluster() -> vmss_operator::crd::AzureCluster {
    use vmss_operator::crd::{
        AzureCluster, AzureClusterSpec, ControlPlaneSpec, ReleaseSpec, SecretReference,
    };
    AzureCluster::new(
        "c7",
        AzureClusterSpec {
            location: "westeurope".to_string(),
            resource_group: None,
            credential_secret: SecretReference {
                name: "azure-sp".to_string(),
                namespace: None,
            },
            release: ReleaseSpec::default(),
            control_plane: ControlPlaneSpec {
                vm_size: "Standard_D4s_v5".to_string(),
                replicas: 1,
                availability_zones: Vec::new(),
                storage_account_type: None,
            },
        },
    )
}
