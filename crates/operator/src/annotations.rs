//! Annotation and label keys recognised on pods and custom resources

/// API group; every key below lives under this prefix.
pub const GROUP: &str = "modal-operator.io";

/// Marks a pod for offload ("true").
pub const USE_MODAL: &str = "modal-operator.io/use-modal";
/// Marks a pod for offload ("true"), older spelling.
pub const OFFLOAD: &str = "modal-operator.io/offload";
/// Set by the admission mutator on every pod it rewrites.
pub const MUTATED: &str = "modal-operator.io/mutated";
/// Set by the admission mutator; the sidecar tunnel is expected.
pub const TUNNEL_ENABLED: &str = "modal-operator.io/tunnel-enabled";
/// Explicit workload type, "job" or "function".
pub const WORKLOAD_TYPE: &str = "modal-operator.io/workload-type";
/// Image override for the remote execution.
pub const IMAGE: &str = "modal-operator.io/image";
/// Command override (whitespace-separated).
pub const COMMAND: &str = "modal-operator.io/command";
/// GPU specification, e.g. "T4:1".
pub const GPU: &str = "modal-operator.io/gpu";
/// GPU type used when only a device-plugin count is present.
pub const GPU_TYPE: &str = "modal-operator.io/gpu-type";
/// Memory quantity for the remote execution.
pub const MEMORY: &str = "modal-operator.io/memory";
/// CPU allocation for the remote execution.
pub const CPU: &str = "modal-operator.io/cpu";
/// Timeout in seconds.
pub const TIMEOUT: &str = "modal-operator.io/timeout";
/// Retry budget.
pub const RETRIES: &str = "modal-operator.io/retries";
/// Request a tunnel back into the cluster ("true").
pub const TUNNEL: &str = "modal-operator.io/tunnel";
/// Port the tunnel forwards to.
pub const TUNNEL_PORT: &str = "modal-operator.io/tunnel-port";
/// Replica count for distributed jobs.
pub const REPLICAS: &str = "modal-operator.io/replicas";
/// Join the backend's private IPv6 network ("true").
pub const ENABLE_I6PN: &str = "modal-operator.io/enable-i6pn";
/// Prefix of per-variable environment overrides; the remainder of the key
/// is the variable name and wins over container env on collision.
pub const ENV_PREFIX: &str = "modal-operator.io/env-";
/// The image the pod carried before mutation.
pub const ORIGINAL_IMAGE: &str = "modal-operator.io/original-image";
/// JSON capsule of the pod's pre-mutation networking configuration.
pub const ORIGINAL_NETWORKING: &str = "modal-operator.io/original-networking";
/// Annotation on managed Services pointing back at the function URL.
pub const FUNCTION_URL: &str = "modal-operator.io/function-url";
/// Label naming the function a managed Service belongs to.
pub const FUNCTION: &str = "modal-operator.io/function";
/// Label on Services managed by this operator.
pub const MANAGED: &str = "modal-operator.io/managed";
/// Label selecting the stand-in pod for the tunnel Service.
pub const TUNNEL_POD_LABEL: &str = "modal-operator.io/tunnel-pod";
/// Label on tunnel Services.
pub const TUNNEL_LABEL: &str = "modal-operator.io/tunnel";
/// Label (on CRs and Services) naming the originating pod.
pub const ORIGINAL_POD: &str = "modal-operator.io/original-pod";
/// Finalizer the reconcilers hold while a remote app exists.
pub const FINALIZER: &str = "modal-operator.io/finalizer";
