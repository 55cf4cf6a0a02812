//! Enumerated wire values. All of them are 'open': values this implementation does not know
//!  about are preserved in a catch-all variant rather than rejected, since peers may legally
//!  send vendor specific or future values.

use num_enum::{FromPrimitive, IntoPrimitive};

/// Maximum APDU length accepted, encoded in the low nibble of the second octet of a
///  Confirmed-Request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MaxApduLength {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
    #[num_enum(catch_all)]
    Reserved(u8),
}

impl MaxApduLength {
    /// Reserved codes are treated as the smallest length defined for all data links
    pub fn octets(self) -> usize {
        match self {
            MaxApduLength::Up50 => 50,
            MaxApduLength::Up128 => 128,
            MaxApduLength::Up206 => 206,
            MaxApduLength::Up480 => 480,
            MaxApduLength::Up1024 => 1024,
            MaxApduLength::Up1476 => 1476,
            MaxApduLength::Reserved(_) => 50,
        }
    }

    /// the biggest code whose length does not exceed `octets`
    pub fn for_octets(octets: usize) -> MaxApduLength {
        [
            MaxApduLength::Up1476,
            MaxApduLength::Up1024,
            MaxApduLength::Up480,
            MaxApduLength::Up206,
            MaxApduLength::Up128,
        ].into_iter()
            .find(|m| m.octets() <= octets)
            .unwrap_or(MaxApduLength::Up50)
    }
}

/// Maximum number of segments accepted, encoded in bits 6-4 of the second octet of a
///  Confirmed-Request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    MoreThanSixtyFour = 7,
    #[num_enum(catch_all)]
    Reserved(u8),
}

impl MaxSegments {
    /// `None` if the peer did not state a limit
    pub fn limit(self) -> Option<usize> {
        match self {
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
            MaxSegments::Unspecified | MaxSegments::MoreThanSixtyFour | MaxSegments::Reserved(_) => None,
        }
    }
}

/// A device's segmentation capability as announced in I-Am
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    NoSegmentation = 3,
    #[num_enum(catch_all)]
    Reserved(u8),
}

impl Segmentation {
    pub fn can_receive(self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }

    pub fn can_transmit(self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    AtomicReadFile = 6,
    AtomicWriteFile = 7,
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,
    ReadRange = 26,
    GetEventInformation = 29,
    #[num_enum(catch_all)]
    Other(u8),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    #[num_enum(catch_all)]
    Other(u8),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDataType = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
    #[num_enum(catch_all)]
    Proprietary(u8),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
    #[num_enum(catch_all)]
    Proprietary(u8),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ErrorClass {
    Device = 0,
    Object = 1,
    Property = 2,
    Resources = 3,
    Security = 4,
    Services = 5,
    Vt = 6,
    Communication = 7,
    #[num_enum(catch_all)]
    Proprietary(u16),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    Other = 0,
    ConfigurationInProgress = 2,
    DeviceBusy = 3,
    DynamicCreationNotSupported = 4,
    FileAccessDenied = 5,
    InconsistentParameters = 7,
    InconsistentSelectionCriterion = 8,
    InvalidDataType = 9,
    InvalidFileAccessMethod = 10,
    InvalidFileStartPosition = 11,
    InvalidParameterDataType = 13,
    InvalidTimeStamp = 14,
    MissingRequiredParameter = 16,
    NoObjectsOfSpecifiedType = 17,
    NoSpaceForObject = 18,
    NoSpaceToAddListElement = 19,
    NoSpaceToWriteProperty = 20,
    NoVtSessionsAvailable = 21,
    PropertyIsNotAList = 22,
    ObjectDeletionNotPermitted = 23,
    ObjectIdentifierAlreadyExists = 24,
    OperationalProblem = 25,
    PasswordFailure = 26,
    ReadAccessDenied = 27,
    ServiceRequestDenied = 29,
    Timeout = 30,
    UnknownObject = 31,
    UnknownProperty = 32,
    UnknownVtClass = 34,
    UnknownVtSession = 35,
    UnsupportedObjectType = 36,
    ValueOutOfRange = 37,
    VtSessionAlreadyClosed = 38,
    VtSessionTerminationFailure = 39,
    WriteAccessDenied = 40,
    CharacterSetNotSupported = 41,
    InvalidArrayIndex = 42,
    #[num_enum(catch_all)]
    Proprietary(u16),
}
