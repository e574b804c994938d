use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("A deployment is already in progress. Please wait for it to complete.")]
    AlreadyInProgress,

    #[error(
        "Canary deployment {deployment_id} failed at stage {stage} ({percentage}%) - automatic rollback completed"
    )]
    RolledBack {
        deployment_id: String,
        stage: usize,
        percentage: u32,
    },
}
