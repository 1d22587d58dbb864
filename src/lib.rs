pub mod rpc;

// 公開API
pub use rpc::{
    CallError, CallInfo, Envelope, EnvelopeKind, FrameConfig, FramedTransport, MemoryTransport,
    Messenger, MessengerConfig, MessengerError, MethodHandler, PendingCall, RawFailure,
    RemoteFailure, StructuredError, Transport, TransportError,
};
