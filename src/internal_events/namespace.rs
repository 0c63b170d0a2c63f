use metrics::counter;

use super::InternalEvent;

#[derive(Debug)]
pub struct NamespaceCreated<'a> {
    pub name: &'a str,
}

impl InternalEvent for NamespaceCreated<'_> {
    fn emit_logs(&self) {
        info!(message = "Created namespace.", namespace = %self.name);
    }

    fn emit_metrics(&self) {
        counter!("namespaces_created_total").increment(1);
    }
}

#[derive(Debug)]
pub struct NamespaceDeleted<'a> {
    pub name: &'a str,
    pub existed: bool,
}

impl InternalEvent for NamespaceDeleted<'_> {
    fn emit_logs(&self) {
        if self.existed {
            info!(message = "Deleted namespace.", namespace = %self.name);
        } else {
            debug!(message = "Namespace was already gone.", namespace = %self.name);
        }
    }

    fn emit_metrics(&self) {
        counter!("namespaces_deleted_total").increment(1);
    }
}
