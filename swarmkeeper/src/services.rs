use std::sync::Arc;

use crate::addon::DatacenterAddon;
use crate::membership::ClusterMembership;
use crate::mutex::UpgradeMutex;
use crate::probe::LivenessProbe;
use crate::resolver::NodeResolver;
use crate::scaleset::ScaleSetProvider;
use crate::state::StateStore;
use crate::upgrade::TemplateSource;

/// Handles to every collaborator a control loop may need.
///
/// Cheap to clone; all members are shared.
#[derive(Clone)]
pub struct Services {
    pub cluster: Arc<dyn ClusterMembership>,
    pub provider: Arc<dyn ScaleSetProvider>,
    pub state: StateStore,
    pub mutex: UpgradeMutex,
    pub probe: Arc<dyn LivenessProbe>,
    pub templates: Arc<dyn TemplateSource>,
    pub addon: Option<Arc<dyn DatacenterAddon>>,
}

impl Services {
    pub fn resolver(&self) -> NodeResolver {
        NodeResolver::new(self.provider.clone(), self.cluster.clone())
    }
}
