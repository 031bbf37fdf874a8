/// Message kinds in wire order. The discriminants are the on-wire `u32`
/// values, assigned from zero; reordering is a protocol break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgKind {
    Register = 0,
    Login,
    RegisterOk,
    RegisterFail,
    LoginOk,
    LoginFail,
    Initial,
    Join,
    Exit,
    GroupMsg,
    FileStart,
    FileData,
    FileEnd,
    Ping,
    PingOk,
}

impl MsgKind {
    /// Decodes a raw wire discriminant. `None` for kinds this server does
    /// not know, which callers drop rather than treat as fatal.
    pub fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Register,
            1 => Self::Login,
            2 => Self::RegisterOk,
            3 => Self::RegisterFail,
            4 => Self::LoginOk,
            5 => Self::LoginFail,
            6 => Self::Initial,
            7 => Self::Join,
            8 => Self::Exit,
            9 => Self::GroupMsg,
            10 => Self::FileStart,
            11 => Self::FileData,
            12 => Self::FileEnd,
            13 => Self::Ping,
            14 => Self::PingOk,
            _ => return None,
        })
    }

    /// Stable name for log records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Login => "LOGIN",
            Self::RegisterOk => "REGISTER_OK",
            Self::RegisterFail => "REGISTER_FAIL",
            Self::LoginOk => "LOGIN_OK",
            Self::LoginFail => "LOGIN_FAIL",
            Self::Initial => "INITIAL",
            Self::Join => "JOIN",
            Self::Exit => "EXIT",
            Self::GroupMsg => "GROUP_MSG",
            Self::FileStart => "FILE_START",
            Self::FileData => "FILE_DATA",
            Self::FileEnd => "FILE_END",
            Self::Ping => "PING",
            Self::PingOk => "PING_OK",
        }
    }
}
