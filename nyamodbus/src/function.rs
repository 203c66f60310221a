/// High bit of the function code marks an exception response
pub const EXCEPTION_BIT: u8 = 0x80;

/// MEI type of the read device identification sub-protocol
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadContacts = 2,
    ReadHolding = 3,
    ReadInputs = 4,
    WriteCoil = 5,
    WriteHolding = 6,
    WriteCoils = 15,
    WriteHoldings = 16,
    ReadDeviceIdentification = 43,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        let function = match code {
            1 => FunctionCode::ReadCoils,
            2 => FunctionCode::ReadContacts,
            3 => FunctionCode::ReadHolding,
            4 => FunctionCode::ReadInputs,
            5 => FunctionCode::WriteCoil,
            6 => FunctionCode::WriteHolding,
            15 => FunctionCode::WriteCoils,
            16 => FunctionCode::WriteHoldings,
            43 => FunctionCode::ReadDeviceIdentification,
            _ => return None,
        };
        Some(function)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Request carries a size byte followed by a data section
    pub fn has_request_data(self) -> bool {
        matches!(self, FunctionCode::WriteCoils | FunctionCode::WriteHoldings)
    }

    /// Response starts with a size byte right after the function code
    pub fn has_response_data(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadContacts
                | FunctionCode::ReadHolding
                | FunctionCode::ReadInputs
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        FunctionCode::from_u8(code).ok_or(code)
    }
}

impl From<FunctionCode> for u8 {
    fn from(function: FunctionCode) -> u8 {
        function.code()
    }
}
