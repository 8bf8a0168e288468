//! Prints the CRDs served by the controller as a multi-document YAML stream.
//!
//! Usage:
//!   cargo run --bin crdgen | kubectl apply -f -

use anyhow::Result;
use composite_controller::crd::{CompositeController, ControllerRevision};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&CompositeController::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ControllerRevision::crd())?);
    Ok(())
}
