use thiserror::Error;

#[derive(Debug, Error)]
pub enum EasyWorkError {
    #[error(transparent)]
    Construct(#[from] ConstructError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("type validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("nodes must be opened before activation: {}", .0.join(", "))]
    NotOpened(Vec<String>),

    #[error("execution graph contains a cycle through `{0}`")]
    Cycle(String),

    #[error("node `{node}` failed at run time: {source}")]
    Runtime {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("topology trace failed: {0}")]
    Trace(#[source] anyhow::Error),

    #[error("pipeline lifecycle error: {0}")]
    Lifecycle(String),
}

#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),

    #[error("unknown parameter `{name}` for node type `{node}`")]
    UnknownParameter { node: String, name: String },

    #[error("missing required parameter `{name}` for node type `{node}`")]
    MissingParameter { node: String, name: String },

    #[error("parameter `{name}` expects `{expected}`, got `{found}`")]
    ParameterType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("node `{node}` has no method {method}")]
    UnknownMethod { node: String, method: String },

    #[error("method `{method}` expects {expected} arguments, got {found}")]
    ArgCountMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of `{method}` expects `{expected}`, got `{found}`")]
    ArgTypeMismatch {
        method: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("value of type `{found}` cannot be read as `{expected}`")]
    ValueType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value has already been moved out")]
    EmptyValue,

    #[error("type `{descriptor}` has no component {index}")]
    Component {
        descriptor: &'static str,
        index: usize,
    },
}

/// The aggregated result of walking every recorded edge binding. Validation
/// never stops at the first fault; the full list is reported at once.
#[derive(Debug)]
pub struct ValidationError {
    pub faults: Vec<EdgeFault>,
}

impl std::error::Error for ValidationError {}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault(s)", self.faults.len())?;
        for fault in &self.faults {
            write!(f, "\n  - {fault}")?;
        }
        Ok(())
    }
}

/// One fault found on a recorded edge binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeFault {
    /// The producer's output descriptor does not match the descriptor the
    /// consumer declared for that input slot.
    TypeMismatch {
        consumer: String,
        consumer_method: &'static str,
        input_index: usize,
        producer: String,
        producer_method: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    /// The consumed output is `void`, which never carries edges.
    VoidProducer {
        consumer: String,
        consumer_method: &'static str,
        input_index: usize,
        producer: String,
        producer_method: &'static str,
    },
    /// The number of recorded bindings does not cover the declared inputs.
    ArityMismatch {
        consumer: String,
        consumer_method: &'static str,
        expected: usize,
        found: usize,
    },
}

impl std::fmt::Display for EdgeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeFault::TypeMismatch {
                consumer,
                consumer_method,
                input_index,
                producer,
                producer_method,
                expected,
                found,
            } => write!(
                f,
                "input {input_index} of `{consumer}.{consumer_method}` expects `{expected}`, \
                 but `{producer}.{producer_method}` produces `{found}`"
            ),
            EdgeFault::VoidProducer {
                consumer,
                consumer_method,
                input_index,
                producer,
                producer_method,
            } => write!(
                f,
                "input {input_index} of `{consumer}.{consumer_method}` consumes from \
                 `{producer}.{producer_method}`, which produces no value"
            ),
            EdgeFault::ArityMismatch {
                consumer,
                consumer_method,
                expected,
                found,
            } => write!(
                f,
                "`{consumer}.{consumer_method}` declares {expected} inputs, \
                 but {found} were bound"
            ),
        }
    }
}
