//! Classification of table keys into drops and forwards.

use crate::agent::table::Key;

/// Reason code for a drop the datapath could not categorize.
pub const DROP_INVALID: u8 = 2;

/// First reason code of the reserved drop range.
pub const DROP_MIN: u8 = 130;

/// Label used for reason codes without a known name.
pub const UNKNOWN_REASON: &str = "Unknown reason";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Unknown,
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ingress => "INGRESS",
            Self::Egress => "EGRESS",
        }
    }
}

impl From<u8> for Direction {
    fn from(dir: u8) -> Self {
        match dir {
            1 => Self::Ingress,
            2 => Self::Egress,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    Drop {
        reason: &'static str,
        direction: Direction,
    },
    Forward {
        direction: Direction,
    },
}

impl Classification {
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop { .. })
    }
}

impl Key {
    pub fn is_drop(&self) -> bool {
        self.reason == DROP_INVALID || self.reason >= DROP_MIN
    }

    pub fn direction(&self) -> Direction {
        Direction::from(self.dir)
    }

    /// Human readable name of the reason code. Only meaningful for drops.
    pub fn reason_label(&self) -> &'static str {
        drop_reason(self.reason)
    }

    pub fn classify(&self) -> Classification {
        if self.is_drop() {
            Classification::Drop {
                reason: self.reason_label(),
                direction: self.direction(),
            }
        } else {
            Classification::Forward {
                direction: self.direction(),
            }
        }
    }
}

/// Returns the name of a datapath reason code.
pub fn drop_reason(reason: u8) -> &'static str {
    match reason {
        0 => "Success",
        2 => "Invalid packet",
        3 => "Interface",
        4 => "Interface Decrypted",
        5 => "LB: No backend slot entry found",
        6 => "LB: No backend entry found",
        7 => "LB: Reverse entry update failed",
        8 => "LB: Reverse entry stale",
        9 => "Fragmented packet",
        10 => "Fragmented packet entry update failed",
        11 => "Missed tail call to custom program",
        130 => "Invalid source mac",
        131 => "Invalid destination mac",
        132 => "Invalid source ip",
        133 => "Policy denied",
        134 => "Invalid packet",
        135 => "CT: Truncated or invalid header",
        136 => "Fragmentation needed",
        137 => "CT: Unknown L4 protocol",
        138 => "CT: Can't create entry from packet",
        139 => "Unsupported L3 protocol",
        140 => "Missed tail call",
        141 => "Error writing to packet",
        142 => "Unknown L4 protocol",
        143 => "Unknown ICMPv4 code",
        144 => "Unknown ICMPv4 type",
        145 => "Unknown ICMPv6 code",
        146 => "Unknown ICMPv6 type",
        147 => "Error retrieving tunnel key",
        148 => "Error retrieving tunnel options",
        149 => "Invalid Geneve option",
        150 => "Unknown L3 target address",
        151 => "Stale or unroutable IP",
        152 => "No matching local container found",
        153 => "Error while correcting L3 checksum",
        154 => "Error while correcting L4 checksum",
        155 => "CT: Map insertion failed",
        156 => "Invalid IPv6 extension header",
        157 => "IP fragmentation not supported",
        158 => "Service backend not found",
        160 => "No tunnel/encapsulation endpoint",
        161 => "Failed to insert into proxymap",
        162 => "Policy denied (CIDR)",
        163 => "Unknown connection tracking state",
        164 => "Local host is unreachable",
        165 => "No configuration available to perform policy decision",
        166 => "Unsupported L2 protocol",
        167 => "No mapping for NAT masquerade",
        168 => "Unsupported protocol for NAT masquerade",
        169 => "FIB lookup failed",
        170 => "Encapsulation traffic is prohibited",
        171 => "Invalid identity",
        172 => "Unknown sender",
        173 => "NAT not needed",
        174 => "Is a ClusterIP",
        175 => "First logical datagram fragment not found",
        176 => "Forbidden ICMPv6 message",
        177 => "Denied by LB src range check",
        178 => "Socket lookup failed",
        179 => "Socket assign failed",
        180 => "Proxy redirection not supported for protocol",
        _ => UNKNOWN_REASON,
    }
}
