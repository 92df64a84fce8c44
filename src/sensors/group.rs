use serde_json::Value;
use crate::types::{GroupId, GroupKind, GroupStatus, SensorId};
/// Name markers of the force-platform load cells, per axis.
pub const PLATFORM_X_MARKERS: [&str; 4] = ["X_1", "X_2", "X_3", "X_4"];
pub const PLATFORM_Y_MARKERS: [&str; 4] = ["Y_1", "Y_2", "Y_3", "Y_4"];
pub const PLATFORM_Z_MARKERS: [&str; 4] = ["Z_1", "Z_2", "Z_3", "Z_4"];
pub struct SensorGroup {
    id: GroupId,
    key: String,
    name: String,
    kind: GroupKind,
    read: bool,
    status: GroupStatus,
    sensors: Vec<SensorId>,
    properties: Value,
}
impl SensorGroup {
    pub(crate) fn new(
        id: GroupId,
        key: String,
        name: String,
        kind: GroupKind,
        read: bool,
        properties: Value,
    ) -> Self {
        Self {
            id,
            key,
            name,
            kind,
            read,
            status: if read {
                GroupStatus::Ok
            } else {
                GroupStatus::Ignored
            },
            sensors: Vec::new(),
            properties,
        }
    }
    pub fn id(&self) -> GroupId {
        self.id
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> GroupKind {
        self.kind
    }
    pub fn read(&self) -> bool {
        self.read
    }
    pub fn status(&self) -> GroupStatus {
        self.status
    }
    /// Member handles in declaration order.
    pub fn sensors(&self) -> &[SensorId] {
        &self.sensors
    }
    pub fn properties(&self) -> &Value {
        &self.properties
    }
    pub(crate) fn push(&mut self, sensor: SensorId) {
        self.sensors.push(sensor);
    }
    pub(crate) fn set_read(&mut self, read: bool) {
        self.read = read;
    }
    pub(crate) fn set_status(&mut self, status: GroupStatus) {
        self.status = status;
    }
}
/// Platform load-cell names sorted by axis, declaration order kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisMembers {
    pub x: Vec<String>,
    pub y: Vec<String>,
    pub z: Vec<String>,
}
impl AxisMembers {
    /// A name is assigned to the first axis whose marker it contains.
    pub fn classify<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut members = Self::default();
        let has = |name: &str, markers: &[&str]| markers.iter().any(|m| name.contains(m));
        for name in names {
            if has(name, &PLATFORM_X_MARKERS) {
                members.x.push(name.to_owned());
            } else if has(name, &PLATFORM_Y_MARKERS) {
                members.y.push(name.to_owned());
            } else if has(name, &PLATFORM_Z_MARKERS) {
                members.z.push(name.to_owned());
            }
        }
        members
    }
    pub fn is_empty(&self) -> bool {
        self.x.is_empty() && self.y.is_empty() && self.z.is_empty()
    }
    /// Two horizontal cells per axis and four vertical ones are needed for the moments.
    pub fn supports_cop(&self) -> bool {
        self.x.len() == 2 && self.y.len() == 2 && self.z.len() == 4
    }
}
