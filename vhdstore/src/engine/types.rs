/// What every volume operation returns: the VDI as seen from outside this
/// crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiDescriptor {
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub vsize: u64,
    pub physical_utilisation: u64,
    pub uri: String,
}
