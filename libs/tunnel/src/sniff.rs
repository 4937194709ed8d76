use once_cell::sync::Lazy;
use regex::bytes::Regex;

/// Application protocols we recognise in the first bytes of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AppProtocol {
    Ssh = 1,
    Tls = 2,
    Http = 3,
    WebSocket = 4,
    Smtp = 5,
    Pop3 = 6,
    Imap = 7,
    Ftp = 8,
    Rdp = 9,
    Vnc = 10,
    Telnet = 11,
    Redis = 12,
    Postgres = 13,
    MySql = 14,
    MongoDb = 15,
    Mqtt = 16,
    Amqp = 17,
    Sip = 18,
    Socks5 = 19,
    Steam = 20,
}

impl AppProtocol {
    pub fn name(self) -> &'static str {
        match self {
            AppProtocol::Ssh => "SSH",
            AppProtocol::Tls => "TLS",
            AppProtocol::Http => "HTTP",
            AppProtocol::WebSocket => "WS",
            AppProtocol::Smtp => "SMTP",
            AppProtocol::Pop3 => "POP3",
            AppProtocol::Imap => "IMAP",
            AppProtocol::Ftp => "FTP",
            AppProtocol::Rdp => "RDP",
            AppProtocol::Vnc => "VNC",
            AppProtocol::Telnet => "Telnet",
            AppProtocol::Redis => "Redis",
            AppProtocol::Postgres => "Postgre",
            AppProtocol::MySql => "MySQL",
            AppProtocol::MongoDb => "MongoDB",
            AppProtocol::Mqtt => "MQTT",
            AppProtocol::Amqp => "AMQP",
            AppProtocol::Sip => "SIP",
            AppProtocol::Socks5 => "SOCKS5",
            AppProtocol::Steam => "Steam",
        }
    }

    pub(crate) fn from_id(id: u32) -> Option<Self> {
        ALL.iter().copied().find(|p| *p as u32 == id)
    }
}

const ALL: &[AppProtocol] = &[
    AppProtocol::Ssh,
    AppProtocol::Tls,
    AppProtocol::Http,
    AppProtocol::WebSocket,
    AppProtocol::Smtp,
    AppProtocol::Pop3,
    AppProtocol::Imap,
    AppProtocol::Ftp,
    AppProtocol::Rdp,
    AppProtocol::Vnc,
    AppProtocol::Telnet,
    AppProtocol::Redis,
    AppProtocol::Postgres,
    AppProtocol::MySql,
    AppProtocol::MongoDb,
    AppProtocol::Mqtt,
    AppProtocol::Amqp,
    AppProtocol::Sip,
    AppProtocol::Socks5,
    AppProtocol::Steam,
];

/// Matchers tried in order; generic patterns (MQTT's single type byte) come
/// after the ones they would otherwise shadow.
static MATCHERS: Lazy<Vec<(AppProtocol, Regex)>> = Lazy::new(|| {
    [
        (AppProtocol::Ssh, r"^SSH-\d+\.\d+-"),
        (AppProtocol::Tls, r"(?s-u)^\x16\x03[\x00-\x03]"),
        (AppProtocol::WebSocket, r"(?i)^GET .*Upgrade:\s*websocket"),
        (
            AppProtocol::Http,
            r"^(GET|POST|HEAD|PUT|DELETE|OPTIONS|TRACE|CONNECT) ",
        ),
        (AppProtocol::Smtp, r"^220 .* ESMTP"),
        (AppProtocol::Pop3, r"^\+OK POP3"),
        (AppProtocol::Imap, r"^\* OK \[CAPABILITY"),
        (AppProtocol::Ftp, r"^220 .* FTP server"),
        (AppProtocol::Rdp, r"(?s-u)^\x03\x00\x00\x13\x0e\xd0"),
        (AppProtocol::Vnc, r"^RFB \d{3}\.\d{3}\n"),
        (AppProtocol::Telnet, r"(?s)^Trying .*\nConnected to"),
        (AppProtocol::Redis, r"^\*1\r\n\$4\r\nPING\r\n"),
        (AppProtocol::Postgres, r"(?s-u)^\x00\x03\x00\x00"),
        (AppProtocol::MySql, r"(?s-u)^\x10\x00\x00\x01"),
        (AppProtocol::MongoDb, r"(?s-u)^\x80\x00\x00\x00"),
        (AppProtocol::Amqp, r"(?s-u)^AMQP\x00\x00\x09\x01"),
        (AppProtocol::Sip, r"(?i)^(INVITE|REGISTER) sip:"),
        (AppProtocol::Socks5, r"(?s-u)^\x05\x01\x00"),
        (AppProtocol::Steam, r"(?s-u)^\xff\xff\xff\xff"),
        (AppProtocol::Mqtt, r"(?s-u)^\x10."),
    ]
    .into_iter()
    .map(|(protocol, pattern)| {
        let regex = Regex::new(pattern).expect("static pattern must compile");

        (protocol, regex)
    })
    .collect()
});

/// Best-effort, single-shot detection on the first chunk of a flow.
pub(crate) fn detect(data: &[u8]) -> Option<AppProtocol> {
    MATCHERS
        .iter()
        .find(|(_, regex)| regex.is_match(data))
        .map(|(protocol, _)| *protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_banners() {
        assert_eq!(detect(b"SSH-2.0-OpenSSH_9.6"), Some(AppProtocol::Ssh));
        assert_eq!(detect(b"\x16\x03\x01\x02\x00\x01"), Some(AppProtocol::Tls));
        assert_eq!(detect(b"GET / HTTP/1.1\r\n"), Some(AppProtocol::Http));
        assert_eq!(
            detect(b"GET /chat Upgrade: websocket"),
            Some(AppProtocol::WebSocket)
        );
        assert_eq!(
            detect(b"220 mail.example.com ESMTP Postfix"),
            Some(AppProtocol::Smtp)
        );
        assert_eq!(detect(b"RFB 003.008\n"), Some(AppProtocol::Vnc));
        assert_eq!(detect(b"\x05\x01\x00"), Some(AppProtocol::Socks5));
        assert_eq!(
            detect(b"\xff\xff\xff\xffTsource engine query"),
            Some(AppProtocol::Steam)
        );
    }

    #[test]
    fn specific_patterns_win_over_mqtt() {
        // Both start with 0x10; the MySQL handshake must not be tagged MQTT.
        assert_eq!(detect(b"\x10\x00\x00\x01\x85"), Some(AppProtocol::MySql));
        assert_eq!(detect(b"\x10\x2a"), Some(AppProtocol::Mqtt));
    }

    #[test]
    fn unknown_traffic_is_untagged() {
        assert_eq!(detect(b"nothing recognisable"), None);
        assert_eq!(detect(b""), None);
    }

    #[test]
    fn ids_round_trip() {
        for protocol in ALL {
            assert_eq!(AppProtocol::from_id(*protocol as u32), Some(*protocol));
        }

        assert_eq!(AppProtocol::from_id(0), None);
        assert_eq!(AppProtocol::from_id(99), None);
    }
}
