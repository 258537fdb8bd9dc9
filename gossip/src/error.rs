use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("gossip object is missing its action field `{0}`")]
    MissingActionKey(String),

    #[error("unknown gossip action `{0}`")]
    UnknownAction(String),

    #[error("malformed gossip frame: {0}")]
    Deserialization(String),

    #[error("result carries {count} extra blocks, limit is {limit}")]
    LimitExceeded { count: usize, limit: usize },
}
