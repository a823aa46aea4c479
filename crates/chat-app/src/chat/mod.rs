mod branch;
mod controller;
mod generation;
mod path;
mod protocol;
mod service;

pub use branch::{Branch, EditBranchManager, EditRequest};
pub use controller::{GenerationController, GenerationRequest, GenerationStream};
pub use generation::{
    GenerationGuard, GenerationRegistry, GenerationState, GenerationTransition,
    GenerationTransitionRejection, GenerationTransitionResult,
};
pub use path::{PathResolver, PathTier, ResolvedPath, TreeNode};
pub use protocol::{ChatEvent, ChunkPart, FrameDecoder, encode_frame};
pub use service::{AttachmentPayload, ChatService, SubmitRequest, UploadRequest};
