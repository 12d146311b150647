use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Default)]
pub struct Topic {
    pub id: Uuid,
    pub name: String,
    /// Partition ids in creation order.
    pub partitions: Vec<i32>,
}

impl Topic {
    pub fn new(name: impl Into<String>, partitions: Vec<i32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            partitions,
        }
    }
}
