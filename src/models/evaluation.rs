///////////////////////////////////////////////////////////////////////////////
// Evaluation /////////////////////////////////////////////////////////////////

/// The description of an evaluation, published once per evaluation on the evaluation stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Evaluation {
    /// A human readable label for the evaluation.
    #[prost(string, tag = "1")]
    pub label: ::prost::alloc::string::String,
    /// The output formats declared for the evaluation.
    #[prost(enumeration = "Format", repeated, tag = "2")]
    pub formats: ::prost::alloc::vec::Vec<i32>,
    /// The measurement unit of the evaluated values.
    #[prost(string, tag = "3")]
    pub measurement_unit: ::prost::alloc::string::String,
}
/// One blob of statistics published on the statistics stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Statistics {
    /// The label of the pool of pairs these statistics were computed from.
    #[prost(string, tag = "1")]
    pub pool: ::prost::alloc::string::String,
    /// The label of the message group to which these statistics belong, if any.
    #[prost(string, tag = "2")]
    pub group: ::prost::alloc::string::String,
    /// The opaque statistics payload.
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

///////////////////////////////////////////////////////////////////////////////
// Status /////////////////////////////////////////////////////////////////////

/// A static description of a subscriber and the formats it is able to deliver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumerDescription {
    /// The identity of the subscriber.
    #[prost(string, tag = "1")]
    pub consumer_id: ::prost::alloc::string::String,
    /// The formats which the subscriber is able to deliver.
    #[prost(enumeration = "Format", repeated, tag = "2")]
    pub formats: ::prost::alloc::vec::Vec<i32>,
}
/// A status message published on the status stream by producers and subscribers alike.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EvaluationStatus {
    /// The completion status being reported.
    #[prost(enumeration = "CompletionStatus", tag = "1")]
    pub completion_status: i32,
    /// The identity of the client which published the message.
    #[prost(string, tag = "2")]
    pub client_id: ::prost::alloc::string::String,
    /// The subscriber publishing the message, if published by a subscriber.
    #[prost(message, optional, tag = "3")]
    pub consumer: ::core::option::Option<ConsumerDescription>,
    /// The message group to which the status applies, if any.
    #[prost(string, tag = "4")]
    pub group_id: ::prost::alloc::string::String,
    /// The number of messages published, for the group or for the whole evaluation.
    #[prost(uint32, tag = "5")]
    pub message_count: u32,
    /// The output resources created.
    #[prost(string, repeated, tag = "6")]
    pub resources_created: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Any events attached to the status, such as the causes of a failure.
    #[prost(message, repeated, tag = "7")]
    pub status_events: ::prost::alloc::vec::Vec<EvaluationStatusEvent>,
    /// The formats required by the evaluation, when requesting a consumer.
    #[prost(enumeration = "Format", repeated, tag = "8")]
    pub formats_required: ::prost::alloc::vec::Vec<i32>,
}
/// An event attached to a status message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EvaluationStatusEvent {
    /// The severity of the event.
    #[prost(enumeration = "StatusMessageType", tag = "1")]
    pub event_type: i32,
    /// The event message.
    #[prost(string, tag = "2")]
    pub event_message: ::prost::alloc::string::String,
}

///////////////////////////////////////////////////////////////////////////////
// Enums //////////////////////////////////////////////////////////////////////

/// The output formats which an evaluation may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Format {
    Unspecified = 0,
    Csv = 1,
    Csv2 = 2,
    Png = 3,
    Svg = 4,
    Netcdf = 5,
    Netcdf2 = 6,
    Protobuf = 7,
}
/// The vocabulary of completion states exchanged over the status stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompletionStatus {
    StatusUnknown = 0,
    /// A producer requests a subscriber to serve an evaluation.
    ConsumerRequired = 1,
    /// A subscriber offers its services, or reports that it is alive and awaiting messages.
    ReadyToConsume = 2,
    /// A subscriber reports that it is alive and consuming.
    ConsumptionOngoing = 3,
    /// A producer reports the number of messages published for one message group.
    GroupPublicationComplete = 4,
    /// A producer reports the number of messages published for the whole evaluation.
    PublicationCompleteReportedSuccess = 5,
    /// A producer reports that publication failed.
    PublicationCompleteReportedFailure = 6,
    /// A producer reports that the evaluation failed.
    EvaluationCompleteReportedFailure = 7,
    /// A subscriber reports that one message group has been consumed.
    GroupConsumptionComplete = 8,
    /// A subscriber reports that the evaluation has been consumed.
    ConsumptionCompleteReportedSuccess = 9,
    /// A subscriber reports that consumption of the evaluation failed.
    ConsumptionCompleteReportedFailure = 10,
}
/// The severity of a status event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusMessageType {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}
