//! Successfully deployed workloads reported at finalize time.
//!
//! Request-scoped only; these are never persisted. They exist to compose the
//! per-resource lines of the summary comment.

use serde::{Deserialize, Deserializer, Serialize};

/// Closed set of workload shapes. Jobs and applications share the same data
/// shape but link to different dashboard pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Job,
    Application,
}

impl<'de> Deserialize<'de> for ResourceKind {
    // Anything that is not a job is a long-running application.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let kind = String::deserialize(deserializer)?;
        if kind == "job" {
            Ok(ResourceKind::Job)
        } else {
            Ok(ResourceKind::Application)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessfulResource {
    pub name: String,
    pub kind: ResourceKind,
}

impl SuccessfulResource {
    /// Dashboard deep link for this resource, by kind.
    pub fn dashboard_link(
        &self,
        server_url: &str,
        cluster_name: &str,
        namespace: &str,
        project_id: i64,
    ) -> String {
        match self.kind {
            ResourceKind::Job => format!(
                "{}/jobs/{}/{}/{}?project_id={}",
                server_url, cluster_name, namespace, self.name, project_id
            ),
            ResourceKind::Application => format!(
                "{}/applications/{}/{}/{}?project_id={}",
                server_url, cluster_name, namespace, self.name, project_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_deserializes_as_application() {
        let res: SuccessfulResource =
            serde_json::from_str(r#"{"name":"api","kind":"web"}"#).expect("deserialize");
        assert_eq!(res.kind, ResourceKind::Application);

        let job: SuccessfulResource =
            serde_json::from_str(r#"{"name":"migrate","kind":"job"}"#).expect("deserialize");
        assert_eq!(job.kind, ResourceKind::Job);
    }

    #[test]
    fn test_link_templates_differ_by_kind() {
        let job = SuccessfulResource {
            name: "worker".to_string(),
            kind: ResourceKind::Job,
        };
        let app = SuccessfulResource {
            name: "worker".to_string(),
            kind: ResourceKind::Application,
        };

        let job_link = job.dashboard_link("https://gantry.example.com", "prod", "pr-4-web", 9);
        let app_link = app.dashboard_link("https://gantry.example.com", "prod", "pr-4-web", 9);

        assert_eq!(
            job_link,
            "https://gantry.example.com/jobs/prod/pr-4-web/worker?project_id=9"
        );
        assert_eq!(
            app_link,
            "https://gantry.example.com/applications/prod/pr-4-web/worker?project_id=9"
        );
    }
}
