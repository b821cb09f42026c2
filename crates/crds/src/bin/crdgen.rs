//! Prints the SpecialResource CRD as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/specialresource.yaml`

use crds::SpecialResource;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&SpecialResource::crd())?);
    Ok(())
}
