//! SMTP command parsing (RFC 5321)

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// HELO <domain>
    Helo(String),
    /// EHLO <domain>
    Ehlo(String),
    /// MAIL FROM:<reverse-path> [SP <mail-parameters>]
    MailFrom {
        address: String,
        parameters: Vec<String>,
    },
    /// RCPT TO:<forward-path>
    RcptTo { address: String },
    /// DATA
    Data,
    /// RSET
    Rset,
    /// STARTTLS
    StartTls,
    /// AUTH mechanism [initial-response]
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// VRFY <string>
    Vrfy(String),
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// Anything unrecognised
    Unknown(String),
}

/// Parse one SMTP command line.
pub fn parse_command(input: &str) -> SmtpCommand {
    let input = input.trim_end_matches(['\r', '\n']);

    let (cmd, args) = match input.find(' ') {
        Some(pos) => (&input[..pos], input[pos + 1..].trim()),
        None => (input, ""),
    };

    match cmd.to_uppercase().as_str() {
        "HELO" => {
            if args.is_empty() {
                SmtpCommand::Unknown(input.to_string())
            } else {
                SmtpCommand::Helo(args.to_string())
            }
        }
        "EHLO" => {
            if args.is_empty() {
                SmtpCommand::Unknown(input.to_string())
            } else {
                SmtpCommand::Ehlo(args.to_string())
            }
        }
        "MAIL" => parse_mail_from(args),
        "RCPT" => parse_rcpt_to(args),
        "DATA" => SmtpCommand::Data,
        "RSET" => SmtpCommand::Rset,
        "STARTTLS" => SmtpCommand::StartTls,
        "AUTH" => parse_auth(args),
        "VRFY" => SmtpCommand::Vrfy(args.to_string()),
        "NOOP" => SmtpCommand::Noop,
        "QUIT" => SmtpCommand::Quit,
        _ => SmtpCommand::Unknown(input.to_string()),
    }
}

fn parse_mail_from(args: &str) -> SmtpCommand {
    if !args.to_uppercase().starts_with("FROM:") {
        return SmtpCommand::Unknown(format!("MAIL {}", args));
    }
    match parse_address_and_params(&args[5..]) {
        Some((address, parameters)) => SmtpCommand::MailFrom {
            address,
            parameters,
        },
        None => SmtpCommand::Unknown(format!("MAIL {}", args)),
    }
}

fn parse_rcpt_to(args: &str) -> SmtpCommand {
    if !args.to_uppercase().starts_with("TO:") {
        return SmtpCommand::Unknown(format!("RCPT {}", args));
    }
    match parse_address_and_params(&args[3..]) {
        Some((address, _)) => SmtpCommand::RcptTo { address },
        None => SmtpCommand::Unknown(format!("RCPT {}", args)),
    }
}

/// AUTH mechanism [initial-response]; `=` stands for an empty response.
fn parse_auth(args: &str) -> SmtpCommand {
    let parts: Vec<&str> = args.splitn(2, ' ').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return SmtpCommand::Unknown(format!("AUTH {}", args));
    }
    let mechanism = parts[0].to_uppercase();
    let initial_response = parts
        .get(1)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    SmtpCommand::Auth {
        mechanism,
        initial_response,
    }
}

fn parse_address_and_params(input: &str) -> Option<(String, Vec<String>)> {
    let input = input.trim();
    if !input.starts_with('<') {
        return None;
    }
    let end = input.find('>')?;
    let address = input[1..end].to_string();
    let parameters: Vec<String> = input[end + 1..]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    Some((address, parameters))
}

/// The `SIZE=` MAIL parameter, when announced by the client.
pub fn declared_size(parameters: &[String]) -> Option<usize> {
    parameters.iter().find_map(|p| {
        let (name, value) = p.split_once('=')?;
        if name.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ehlo() {
        assert_eq!(
            parse_command("EHLO client.example.org\r\n"),
            SmtpCommand::Ehlo("client.example.org".to_string())
        );
    }

    #[test]
    fn test_parse_mail_from_with_size() {
        let cmd = parse_command("MAIL FROM:<ada@acme.com> SIZE=2048");
        match cmd {
            SmtpCommand::MailFrom {
                address,
                parameters,
            } => {
                assert_eq!(address, "ada@acme.com");
                assert_eq!(declared_size(&parameters), Some(2048));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_command("RCPT TO:<bob@acme.com>"),
            SmtpCommand::RcptTo {
                address: "bob@acme.com".to_string()
            }
        );
    }

    #[test]
    fn test_parse_auth_with_initial_response() {
        assert_eq!(
            parse_command("AUTH PLAIN dGVzdA=="),
            SmtpCommand::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("dGVzdA==".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(
            parse_command("BDAT 100"),
            SmtpCommand::Unknown(_)
        ));
        assert!(matches!(
            parse_command("MAIL TO:<x@y.z>"),
            SmtpCommand::Unknown(_)
        ));
    }
}
