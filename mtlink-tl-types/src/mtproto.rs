//! MTProto service constructors.
//!
//! Layout mirrors generated TL code: [`types`] holds bare constructors (their
//! `Deserializable` impl reads the fields only, their `Serializable` impl
//! writes the boxed form with the constructor ID), [`functions`] holds the
//! service RPCs, and [`ServiceMessage`] is the boxed sum type the session
//! engine classifies every incoming body into.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, Identifiable, RawVec, RemoteCall, Serializable};

macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )+
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                <Self as $crate::Identifiable>::CONSTRUCTOR_ID.serialize(buf);
                $( self.$field.serialize(buf); )+
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                Ok(Self { $( $field: <$ty as $crate::Deserializable>::deserialize(buf)?, )+ })
            }
        }
    };
}

/// Reads the constructor ID, checks it and then the bare body of `T`.
#[derive(Clone, Debug, PartialEq)]
pub struct Boxed<T>(pub T);

impl<T: Identifiable + Deserializable> Deserializable for Boxed<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != T::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        T::deserialize(buf).map(Boxed)
    }
}

// ─── Update containers ────────────────────────────────────────────────────────

/// Constructor IDs of the `Updates` family that the server pushes unsolicited.
pub mod updates_ids {
    pub const UPDATES_TOO_LONG: u32 = 0xe317af7e;
    pub const UPDATE_SHORT_MESSAGE: u32 = 0x313bc7f8;
    pub const UPDATE_SHORT_CHAT_MESSAGE: u32 = 0x4d6deea5;
    pub const UPDATE_SHORT: u32 = 0x78d4dec1;
    pub const UPDATES_COMBINED: u32 = 0x725b04c3;
    pub const UPDATES: u32 = 0x74ae4240;
    pub const UPDATE_SHORT_SENT_MESSAGE: u32 = 0x9015e101;

    /// True for every constructor of the `Updates` type.
    pub fn is_updates(id: u32) -> bool {
        matches!(
            id,
            UPDATES_TOO_LONG
                | UPDATE_SHORT_MESSAGE
                | UPDATE_SHORT_CHAT_MESSAGE
                | UPDATE_SHORT
                | UPDATES_COMBINED
                | UPDATES
                | UPDATE_SHORT_SENT_MESSAGE
        )
    }
}

// ─── Bare constructors ────────────────────────────────────────────────────────

pub mod types {
    use super::*;

    tl_object! {
        /// `rpc_result#f35c6d01 req_msg_id:long result:Object`
        RpcResult = 0xf35c6d01 {
            req_msg_id: i64,
            /// The unparsed result object.
            result: Blob,
        }
    }

    tl_object! {
        /// `rpc_error#2144ca19 error_code:int error_message:string`
        RpcError = 0x2144ca19 {
            error_code: i32,
            error_message: String,
        }
    }

    tl_object! {
        /// `rpc_answer_dropped#a43ad8b7 msg_id:long seq_no:int bytes:int`
        RpcAnswerDroppedInfo = 0xa43ad8b7 {
            msg_id: i64,
            seq_no: i32,
            bytes: i32,
        }
    }

    tl_object! {
        /// `pong#347773c5 msg_id:long ping_id:long`
        Pong = 0x347773c5 {
            msg_id: i64,
            ping_id: i64,
        }
    }

    tl_object! {
        /// `future_salt#0949d9dc valid_since:int valid_until:int salt:long`
        FutureSalt = 0x0949d9dc {
            valid_since: i32,
            valid_until: i32,
            salt: i64,
        }
    }

    /// `future_salts#ae500895 req_msg_id:long now:int salts:vector<future_salt>`
    #[derive(Clone, Debug, PartialEq)]
    pub struct FutureSalts {
        pub req_msg_id: i64,
        pub now: i32,
        pub salts: Vec<FutureSalt>,
    }

    impl Identifiable for FutureSalts {
        const CONSTRUCTOR_ID: u32 = 0xae500895;
    }

    impl Serializable for FutureSalts {
        fn serialize(&self, buf: &mut impl Extend<u8>) {
            Self::CONSTRUCTOR_ID.serialize(buf);
            self.req_msg_id.serialize(buf);
            self.now.serialize(buf);
            (self.salts.len() as i32).serialize(buf);
            for s in &self.salts {
                s.valid_since.serialize(buf);
                s.valid_until.serialize(buf);
                s.salt.serialize(buf);
            }
        }
    }

    impl Deserializable for FutureSalts {
        fn deserialize(buf: Buffer) -> Result<Self> {
            let req_msg_id = i64::deserialize(buf)?;
            let now = i32::deserialize(buf)?;
            let RawVec(salts) = RawVec::<FutureSalt>::deserialize(buf)?;
            Ok(Self { req_msg_id, now, salts })
        }
    }

    tl_object! {
        /// `new_session_created#9ec20908 first_msg_id:long unique_id:long server_salt:long`
        NewSessionCreated = 0x9ec20908 {
            first_msg_id: i64,
            unique_id: i64,
            server_salt: i64,
        }
    }

    /// One entry of a `msg_container`: `msg_id:long seqno:int bytes:int body:Object`.
    #[derive(Clone, Debug, PartialEq)]
    pub struct Message {
        pub msg_id: i64,
        pub seqno: i32,
        pub body: Blob,
    }

    impl Serializable for Message {
        fn serialize(&self, buf: &mut impl Extend<u8>) {
            self.msg_id.serialize(buf);
            self.seqno.serialize(buf);
            (self.body.0.len() as i32).serialize(buf);
            self.body.serialize(buf);
        }
    }

    impl Deserializable for Message {
        fn deserialize(buf: Buffer) -> Result<Self> {
            let msg_id = i64::deserialize(buf)?;
            let seqno = i32::deserialize(buf)?;
            let len = i32::deserialize(buf)?;
            if len < 0 || len % 4 != 0 {
                return Err(Error::InvalidLength(len as i64));
            }
            let body = Blob(buf.take(len as usize)?.to_vec());
            Ok(Self { msg_id, seqno, body })
        }
    }

    tl_object! {
        /// `msg_container#73f1f8dc messages:vector<%Message>`
        MsgContainer = 0x73f1f8dc {
            messages: RawVec<Message>,
        }
    }

    tl_object! {
        /// `gzip_packed#3072cfa1 packed_data:bytes`
        GzipPacked = 0x3072cfa1 {
            packed_data: Vec<u8>,
        }
    }

    tl_object! {
        /// `msgs_ack#62d6b459 msg_ids:Vector<long>`
        MsgsAck = 0x62d6b459 {
            msg_ids: Vec<i64>,
        }
    }

    tl_object! {
        /// `bad_msg_notification#a7eff811 bad_msg_id:long bad_msg_seqno:int error_code:int`
        BadMsgNotification = 0xa7eff811 {
            bad_msg_id: i64,
            bad_msg_seqno: i32,
            error_code: i32,
        }
    }

    tl_object! {
        /// `bad_server_salt#edab447b bad_msg_id:long bad_msg_seqno:int error_code:int new_server_salt:long`
        BadServerSalt = 0xedab447b {
            bad_msg_id: i64,
            bad_msg_seqno: i32,
            error_code: i32,
            new_server_salt: i64,
        }
    }

    tl_object! {
        /// `msg_resend_req#7d861a08 msg_ids:Vector<long>`
        MsgResendReq = 0x7d861a08 {
            msg_ids: Vec<i64>,
        }
    }

    tl_object! {
        /// `msgs_state_req#da69fb52 msg_ids:Vector<long>`
        MsgsStateReq = 0xda69fb52 {
            msg_ids: Vec<i64>,
        }
    }

    tl_object! {
        /// `msgs_state_info#04deb57d req_msg_id:long info:string`
        ///
        /// `info` holds one status byte per queried id.
        MsgsStateInfo = 0x04deb57d {
            req_msg_id: i64,
            info: Vec<u8>,
        }
    }

    tl_object! {
        /// `msgs_all_info#8cc0d131 msg_ids:Vector<long> info:string`
        MsgsAllInfo = 0x8cc0d131 {
            msg_ids: Vec<i64>,
            info: Vec<u8>,
        }
    }

    tl_object! {
        /// `msg_detailed_info#276d3ec6 msg_id:long answer_msg_id:long bytes:int status:int`
        MsgDetailedInfo = 0x276d3ec6 {
            msg_id: i64,
            answer_msg_id: i64,
            bytes: i32,
            status: i32,
        }
    }

    tl_object! {
        /// `msg_new_detailed_info#809db6df answer_msg_id:long bytes:int status:int`
        MsgNewDetailedInfo = 0x809db6df {
            answer_msg_id: i64,
            bytes: i32,
            status: i32,
        }
    }

    tl_object! {
        /// `destroy_session_ok#e22045fc session_id:long`
        DestroySessionOk = 0xe22045fc {
            session_id: i64,
        }
    }

    tl_object! {
        /// `destroy_session_none#62d350c9 session_id:long`
        DestroySessionNone = 0x62d350c9 {
            session_id: i64,
        }
    }
}

// ─── Boxed sum types ──────────────────────────────────────────────────────────

pub mod enums {
    use super::*;

    pub const RPC_ANSWER_UNKNOWN_ID: u32 = 0x5e2ad36e;
    pub const RPC_ANSWER_DROPPED_RUNNING_ID: u32 = 0xcd78e586;
    pub const RPC_ANSWER_DROPPED_ID: u32 = 0xa43ad8b7;

    /// `RpcDropAnswer`, the result of `rpc_drop_answer`.
    #[derive(Clone, Debug, PartialEq)]
    pub enum RpcDropAnswer {
        Unknown,
        DroppedRunning,
        Dropped(types::RpcAnswerDroppedInfo),
    }

    impl Deserializable for RpcDropAnswer {
        fn deserialize(buf: Buffer) -> Result<Self> {
            match u32::deserialize(buf)? {
                RPC_ANSWER_UNKNOWN_ID => Ok(Self::Unknown),
                RPC_ANSWER_DROPPED_RUNNING_ID => Ok(Self::DroppedRunning),
                RPC_ANSWER_DROPPED_ID => types::RpcAnswerDroppedInfo::deserialize(buf).map(Self::Dropped),
                id => Err(Error::UnexpectedConstructor { id }),
            }
        }
    }

    /// `DestroySessionRes`
    #[derive(Clone, Debug, PartialEq)]
    pub enum DestroySessionRes {
        Ok(types::DestroySessionOk),
        None(types::DestroySessionNone),
    }

    impl Deserializable for DestroySessionRes {
        fn deserialize(buf: Buffer) -> Result<Self> {
            match u32::deserialize(buf)? {
                types::DestroySessionOk::CONSTRUCTOR_ID => types::DestroySessionOk::deserialize(buf).map(Self::Ok),
                types::DestroySessionNone::CONSTRUCTOR_ID => types::DestroySessionNone::deserialize(buf).map(Self::None),
                id => Err(Error::UnexpectedConstructor { id }),
            }
        }
    }
}

// ─── Functions ────────────────────────────────────────────────────────────────

pub mod functions {
    use super::*;

    tl_object! {
        /// `ping#7abe77ec ping_id:long = Pong`
        Ping = 0x7abe77ec {
            ping_id: i64,
        }
    }

    impl RemoteCall for Ping {
        type Return = Boxed<types::Pong>;
    }

    tl_object! {
        /// `ping_delay_disconnect#f3427b8c ping_id:long disconnect_delay:int = Pong`
        PingDelayDisconnect = 0xf3427b8c {
            ping_id: i64,
            disconnect_delay: i32,
        }
    }

    impl RemoteCall for PingDelayDisconnect {
        type Return = Boxed<types::Pong>;
    }

    tl_object! {
        /// `get_future_salts#b921bd04 num:int = FutureSalts`
        GetFutureSalts = 0xb921bd04 {
            num: i32,
        }
    }

    impl RemoteCall for GetFutureSalts {
        type Return = Boxed<types::FutureSalts>;
    }

    tl_object! {
        /// `rpc_drop_answer#58e4a740 req_msg_id:long = RpcDropAnswer`
        RpcDropAnswer = 0x58e4a740 {
            req_msg_id: i64,
        }
    }

    impl RemoteCall for RpcDropAnswer {
        type Return = enums::RpcDropAnswer;
    }

    tl_object! {
        /// `destroy_session#e7512126 session_id:long = DestroySessionRes`
        DestroySession = 0xe7512126 {
            session_id: i64,
        }
    }

    impl RemoteCall for DestroySession {
        type Return = enums::DestroySessionRes;
    }

    tl_object! {
        /// `invokeAfterMsg#cb9f372d {X:Type} msg_id:long query:!X = X`
        InvokeAfterMsg = 0xcb9f372d {
            msg_id: i64,
            query: Blob,
        }
    }

    impl RemoteCall for InvokeAfterMsg {
        type Return = Blob;
    }
}

// ─── Classification ───────────────────────────────────────────────────────────

/// Every body the server can put inside an encrypted message, classified once
/// by constructor ID.
///
/// Bodies the session layer has no use for (`Updates` pushes, API objects)
/// end up in [`ServiceMessage::Other`] with their constructor ID still in
/// place.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    RpcResult(types::RpcResult),
    MsgContainer(types::MsgContainer),
    GzipPacked(types::GzipPacked),
    Pong(types::Pong),
    MsgsAck(types::MsgsAck),
    BadServerSalt(types::BadServerSalt),
    BadMsgNotification(types::BadMsgNotification),
    NewSessionCreated(types::NewSessionCreated),
    FutureSalts(types::FutureSalts),
    MsgsStateReq(types::MsgsStateReq),
    MsgsStateInfo(types::MsgsStateInfo),
    MsgsAllInfo(types::MsgsAllInfo),
    MsgDetailedInfo(types::MsgDetailedInfo),
    MsgNewDetailedInfo(types::MsgNewDetailedInfo),
    MsgResendReq(types::MsgResendReq),
    DestroySession(enums::DestroySessionRes),
    RpcDropAnswer(enums::RpcDropAnswer),
    Other(Blob),
}

impl ServiceMessage {
    /// Whether the server expects this message to be acknowledged.
    ///
    /// Acks, notifications about bad messages and message-state answers are
    /// never acknowledged themselves.
    pub fn requires_ack(&self) -> bool {
        !matches!(
            self,
            Self::MsgsAck(_)
                | Self::BadServerSalt(_)
                | Self::BadMsgNotification(_)
                | Self::MsgsAllInfo(_)
                | Self::MsgsStateInfo(_)
                | Self::MsgDetailedInfo(_)
                | Self::MsgNewDetailedInfo(_)
                | Self::MsgContainer(_)
        )
    }
}

impl Deserializable for ServiceMessage {
    fn deserialize(buf: Buffer) -> Result<Self> {
        use types::*;
        let id = buf.peek_id()?;
        let msg = match id {
            RpcResult::CONSTRUCTOR_ID => Self::RpcResult(Boxed::<RpcResult>::deserialize(buf)?.0),
            MsgContainer::CONSTRUCTOR_ID => Self::MsgContainer(Boxed::<MsgContainer>::deserialize(buf)?.0),
            GzipPacked::CONSTRUCTOR_ID => Self::GzipPacked(Boxed::<GzipPacked>::deserialize(buf)?.0),
            Pong::CONSTRUCTOR_ID => Self::Pong(Boxed::<Pong>::deserialize(buf)?.0),
            MsgsAck::CONSTRUCTOR_ID => Self::MsgsAck(Boxed::<MsgsAck>::deserialize(buf)?.0),
            BadServerSalt::CONSTRUCTOR_ID => Self::BadServerSalt(Boxed::<BadServerSalt>::deserialize(buf)?.0),
            BadMsgNotification::CONSTRUCTOR_ID => {
                Self::BadMsgNotification(Boxed::<BadMsgNotification>::deserialize(buf)?.0)
            }
            NewSessionCreated::CONSTRUCTOR_ID => {
                Self::NewSessionCreated(Boxed::<NewSessionCreated>::deserialize(buf)?.0)
            }
            FutureSalts::CONSTRUCTOR_ID => Self::FutureSalts(Boxed::<FutureSalts>::deserialize(buf)?.0),
            MsgsStateReq::CONSTRUCTOR_ID => Self::MsgsStateReq(Boxed::<MsgsStateReq>::deserialize(buf)?.0),
            MsgsStateInfo::CONSTRUCTOR_ID => Self::MsgsStateInfo(Boxed::<MsgsStateInfo>::deserialize(buf)?.0),
            MsgsAllInfo::CONSTRUCTOR_ID => Self::MsgsAllInfo(Boxed::<MsgsAllInfo>::deserialize(buf)?.0),
            MsgDetailedInfo::CONSTRUCTOR_ID => {
                Self::MsgDetailedInfo(Boxed::<MsgDetailedInfo>::deserialize(buf)?.0)
            }
            MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                Self::MsgNewDetailedInfo(Boxed::<MsgNewDetailedInfo>::deserialize(buf)?.0)
            }
            MsgResendReq::CONSTRUCTOR_ID => Self::MsgResendReq(Boxed::<MsgResendReq>::deserialize(buf)?.0),
            DestroySessionOk::CONSTRUCTOR_ID | DestroySessionNone::CONSTRUCTOR_ID => {
                Self::DestroySession(enums::DestroySessionRes::deserialize(buf)?)
            }
            enums::RPC_ANSWER_UNKNOWN_ID
            | enums::RPC_ANSWER_DROPPED_RUNNING_ID
            | enums::RPC_ANSWER_DROPPED_ID => Self::RpcDropAnswer(enums::RpcDropAnswer::deserialize(buf)?),
            _ => Self::Other(Blob::deserialize(buf)?),
        };
        Ok(msg)
    }
}
