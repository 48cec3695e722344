// Bundle data model and in-memory store
//
// A bundle has exactly one canonical record in memory, shared through
// `BundleRef` handles. The store owns the four identity indexes; admin
// payload codecs live in `admin`.

pub mod admin;
pub mod framing;
pub mod model;
pub mod payload;
pub mod store;

pub use framing::{decode_bundle_frames, encode_bundle_frame};
pub use admin::{
    AcsEntry, AcsPayload, AdminRecord, CustodySignal, CustodySignalReason, StatusFlags,
    StatusReport, StatusReportReason,
};
pub use model::{
    dtn_time_now, Bundle, BundleMeta, BundleRef, BundleTimestamp, Cteb, ExtensionBlock,
    ForwardingAction, ForwardingInfo, ForwardingState, Gbof, Priority, DTN_TIME_EPOCH_UNIX,
};
pub use payload::Payload;
pub use store::{BundleIdGenerator, BundleStore};
