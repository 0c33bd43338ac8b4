use crate::k8s::{self, api::apps::v1::Deployment, Lease, ObjectMeta, Patch, PatchParams, Resource};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info, Instrument};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "groups-policy-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "groups-policy-controller";

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // Fetch the controller's deployment so that we can use it as an owner
    // reference of the Lease.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch Deployment {ns}/{deployment_name}"))?;

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: deployment.controller_owner_ref(&()).map(|o| vec![o]),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    FIELD_MANAGER.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Publishes whether `hostname` currently holds the write lease.
pub fn leadership(
    hostname: String,
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
) -> watch::Receiver<bool> {
    let leader = claims.borrow_and_update().is_current_for(&hostname);
    let (tx, rx) = watch::channel(leader);
    tokio::spawn(
        async move {
            while claims.changed().await.is_ok() {
                let claim = claims.borrow_and_update().clone();
                let leader = claim.is_current_for(&hostname);
                tx.send_if_modified(|current| {
                    if *current == leader {
                        return false;
                    }
                    info!(leader, holder = %claim.holder, "Write lease changed hands");
                    *current = leader;
                    true
                });
            }
        }
        .instrument(tracing::info_span!("leadership")),
    );
    rx
}
