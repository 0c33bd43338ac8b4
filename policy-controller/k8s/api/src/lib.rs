#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::labels::Selector;
pub use k8s_openapi::{
    api::{self, coordination::v1::Lease},
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};
