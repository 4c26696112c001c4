use crate::models::evaluation::{CompletionStatus, EvaluationStatus, EvaluationStatusEvent, Format, StatusMessageType};

impl Format {
    /// The canonical name of this format, also used as the claim key of message metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Csv => "CSV",
            Self::Csv2 => "CSV2",
            Self::Png => "PNG",
            Self::Svg => "SVG",
            Self::Netcdf => "NETCDF",
            Self::Netcdf2 => "NETCDF2",
            Self::Protobuf => "PROTOBUF",
        }
    }

    /// Parse a format from its canonical name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name.trim().to_ascii_uppercase().as_str() {
            "CSV" => Self::Csv,
            "CSV2" => Self::Csv2,
            "PNG" => Self::Png,
            "SVG" => Self::Svg,
            "NETCDF" => Self::Netcdf,
            "NETCDF2" => Self::Netcdf2,
            "PROTOBUF" => Self::Protobuf,
            _ => return None,
        };
        Some(format)
    }
}

impl CompletionStatus {
    /// True if this status is a producer's report that the evaluation has failed.
    pub fn is_producer_failure(&self) -> bool {
        matches!(self, Self::PublicationCompleteReportedFailure | Self::EvaluationCompleteReportedFailure)
    }
}

impl EvaluationStatus {
    /// Create a new status message with the given completion status.
    pub fn new(status: CompletionStatus, client_id: impl Into<String>) -> Self {
        let mut msg = Self {
            client_id: client_id.into(),
            ..Default::default()
        };
        msg.set_completion_status(status);
        msg
    }
}

impl EvaluationStatusEvent {
    /// Create a new error event with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        let mut event = Self {
            event_message: message.into(),
            ..Default::default()
        };
        event.set_event_type(StatusMessageType::Error);
        event
    }
}
