//! Program, procedure, and status identifiers.

/// The NFS program number shared by every protocol version.
pub const NFS_PROGRAM: u32 = 100_003;

/// NFS protocol versions this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NfsProgram {
    V2,
    V3,
    V4,
}

impl NfsProgram {
    /// Wire version number for the RPC call header.
    #[must_use]
    pub fn version(self) -> u32 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }
}

/// A fully-qualified remote procedure: program version plus procedure
/// number. The procedure number's meaning is version-specific; the
/// transport treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Procedure {
    pub program: NfsProgram,
    pub number: u32,
}

impl Procedure {
    /// The NULL procedure: no arguments, no results, every version.
    /// Useful as a liveness probe without any XDR involvement.
    #[must_use]
    pub fn null(program: NfsProgram) -> Self {
        Self { program, number: 0 }
    }
}

/// NFS status codes relevant to the client core's error classification.
///
/// Not exhaustive over the protocol — only codes the engine, caches, and
/// recovery logic make decisions on, plus `Other` to carry the rest
/// through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NfsStat {
    Ok,
    /// Permission classes — surfaced immediately, never retried.
    Perm,
    Access,
    /// Name errors.
    NoEnt,
    Exist,
    NotDir,
    IsDir,
    /// The file handle no longer identifies the file it used to.
    Stale,
    BadHandle,
    /// Directory cookie no longer valid (directory changed under us).
    BadCookie,
    /// Server asks the client to back off and retry.
    Delay,
    /// NFSv4 state errors — trigger mount-wide recovery.
    Grace,
    Expired,
    BadStateid,
    OldStateid,
    StaleStateid,
    StaleClientid,
    BadSession,
    /// Anything else, carried verbatim.
    Other(u32),
}

impl NfsStat {
    /// Decode a wire status word.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Perm,
            2 => Self::NoEnt,
            13 => Self::Access,
            17 => Self::Exist,
            20 => Self::NotDir,
            21 => Self::IsDir,
            70 => Self::Stale,
            10001 => Self::BadHandle,
            10003 => Self::BadCookie,
            10008 => Self::Delay,
            10013 => Self::Grace,
            10011 => Self::Expired,
            10025 => Self::BadStateid,
            10024 => Self::OldStateid,
            10023 => Self::StaleStateid,
            10022 => Self::StaleClientid,
            10052 => Self::BadSession,
            other => Self::Other(other),
        }
    }

    /// State-error class: the server has invalidated client-held state and
    /// the mount must run recovery before the operation can be re-issued.
    #[must_use]
    pub fn is_state_error(self) -> bool {
        matches!(
            self,
            Self::Grace
                | Self::Expired
                | Self::BadStateid
                | Self::OldStateid
                | Self::StaleStateid
                | Self::StaleClientid
                | Self::BadSession
        )
    }

    /// Stale-handle class: the handle itself is dead; re-resolving the
    /// path is the only way forward.
    #[must_use]
    pub fn is_stale_handle(self) -> bool {
        matches!(self, Self::Stale | Self::BadHandle)
    }

    /// Permission / name class: deterministic, never retried.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::Perm | Self::Access | Self::NoEnt | Self::Exist | Self::NotDir | Self::IsDir
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_are_classified() {
        for code in [10011, 10013, 10022, 10023, 10024, 10025, 10052] {
            assert!(
                NfsStat::from_code(code).is_state_error(),
                "code {code} should be a state error"
            );
        }
        assert!(!NfsStat::from_code(70).is_state_error());
    }

    #[test]
    fn stale_is_not_permanent() {
        let stale = NfsStat::from_code(70);
        assert!(stale.is_stale_handle());
        assert!(!stale.is_permanent());
    }

    #[test]
    fn unknown_codes_round_trip_through_other() {
        assert_eq!(NfsStat::from_code(424_242), NfsStat::Other(424_242));
    }
}
