use genbatch_core::TaskDescriptor;

/// One subject x variant pair as produced by the eligibility query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DescriptorRow {
    pub subject_id: String,
    pub variant_id: String,
    pub subject_name: Option<String>,
    pub category: Option<String>,
    /// SQLite boolean expression, 0 or 1.
    pub has_content: i64,
}

impl DescriptorRow {
    pub fn into_domain(self) -> TaskDescriptor {
        TaskDescriptor {
            subject_id: self.subject_id,
            variant_id: self.variant_id,
            subject_name: self.subject_name,
            category: self.category,
            has_content: self.has_content != 0,
        }
    }
}
