// GB28181 设备侧 SIP 信令
// 编解码、SDP、MANSCDP 消息体、Digest 鉴权与标识生成

pub mod message;
pub mod sdp;
pub mod manscdp;
pub mod builder;
pub mod digest;
pub mod identity;

pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{parse_session_initiation, SdpSession, SessionOffer};
pub use manscdp::{CmdType, ManscdpQuery};
pub use builder::LocalParty;
pub use digest::{compute_digest_response, DigestChallenge, DigestCredentials};
pub use identity::IdentityGenerator;
