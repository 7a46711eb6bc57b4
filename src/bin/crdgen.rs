use kube::CustomResourceExt;
use mesh_operator::crd::ServiceMeshControlPlane;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ServiceMeshControlPlane::crd())?);
    Ok(())
}
