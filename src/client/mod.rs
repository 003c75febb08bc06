/// Peer-side negotiation state machine.
pub mod agent;
/// Collaborators the agent drives: the WebRTC device, local media and the render target.
pub mod device;
