use clap::{value_parser, Arg, ArgAction, Command};

/// One command-line option, kept in the order it was supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    SelectById(String),
    SelectByIndex(i32),
    SwitchOff(i32),
    SwitchOn(i32),
    Toggle(i32),
    GetStatus,
    Help,
    ListDevices,
    DetachKernelDriver,
}

/// Parses argv (program name included) into directives.
///
/// clap owns all syntax errors; the follow-up scan only recovers the
/// left-to-right order that clap's keyed matches throw away.
pub fn parse(args: &[String]) -> Result<Vec<Directive>, clap::Error> {
    command().try_get_matches_from(args)?;
    Ok(scan(args))
}

pub fn usage() -> String {
    command().render_help().to_string()
}

// The builtin help flag is disabled so `-h` can run as an ordered
// directive like everything else.
fn command() -> Command {
    Command::new("relctl")
        .about("Switches FTDI relay boards")
        .disable_help_flag(true)
        .arg(
            Arg::new("device-id")
                .short('D')
                .value_name("ID")
                .action(ArgAction::Append)
                .allow_hyphen_values(true)
                .help("select device by identifier"),
        )
        .arg(
            Arg::new("device-index")
                .short('d')
                .value_name("INDEX")
                .action(ArgAction::Append)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("select device by registry index"),
        )
        .arg(
            Arg::new("off")
                .short('f')
                .value_name("PORT")
                .action(ArgAction::Append)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("switch outlet off"),
        )
        .arg(
            Arg::new("status")
                .short('g')
                .action(ArgAction::Count)
                .help("print status"),
        )
        .arg(
            Arg::new("usage")
                .short('h')
                .action(ArgAction::Count)
                .help("print usage"),
        )
        .arg(
            Arg::new("detach")
                .short('k')
                .action(ArgAction::Count)
                .help("detach kernel driver"),
        )
        .arg(
            Arg::new("on")
                .short('o')
                .value_name("PORT")
                .action(ArgAction::Append)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("switch outlet on"),
        )
        .arg(
            Arg::new("list")
                .short('s')
                .action(ArgAction::Count)
                .help("list devices"),
        )
        .arg(
            Arg::new("toggle")
                .short('t')
                .value_name("PORT")
                .action(ArgAction::Append)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("toggle outlet"),
        )
}

// Getopt-style walk over already-validated tokens. Clusters (`-gs`) and
// attached or detached values (`-o2`, `-t=3`, `-o 2`) land exactly where
// clap put them.
fn scan(args: &[String]) -> Vec<Directive> {
    let mut directives = Vec::new();
    let mut tokens = args.iter().skip(1);
    while let Some(token) = tokens.next() {
        let Some(mut rest) = token.strip_prefix('-') else {
            continue;
        };
        while let Some(letter) = rest.chars().next() {
            rest = &rest[letter.len_utf8()..];
            if takes_value(letter) {
                let raw = if rest.is_empty() {
                    tokens.next().map(String::as_str).unwrap_or_default()
                } else {
                    rest.strip_prefix('=').unwrap_or(rest)
                };
                if let Some(directive) = value_directive(letter, raw) {
                    directives.push(directive);
                }
                break;
            }
            match flag_directive(letter) {
                Some(directive) => directives.push(directive),
                None => break,
            }
        }
    }
    directives
}

fn takes_value(letter: char) -> bool {
    matches!(letter, 'D' | 'd' | 'f' | 'o' | 't')
}

fn value_directive(letter: char, raw: &str) -> Option<Directive> {
    match letter {
        'D' => Some(Directive::SelectById(raw.to_string())),
        'd' => raw.parse().ok().map(Directive::SelectByIndex),
        'f' => raw.parse().ok().map(Directive::SwitchOff),
        'o' => raw.parse().ok().map(Directive::SwitchOn),
        't' => raw.parse().ok().map(Directive::Toggle),
        _ => None,
    }
}

fn flag_directive(letter: char) -> Option<Directive> {
    match letter {
        'g' => Some(Directive::GetStatus),
        'h' => Some(Directive::Help),
        'k' => Some(Directive::DetachKernelDriver),
        's' => Some(Directive::ListDevices),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<String> {
        std::iter::once("relctl")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn keeps_command_line_order() {
        let directives = parse(&argv("-D boardA -o 2 -g -d 1 -f 3")).unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::SelectById("boardA".to_string()),
                Directive::SwitchOn(2),
                Directive::GetStatus,
                Directive::SelectByIndex(1),
                Directive::SwitchOff(3),
            ]
        );
    }

    #[test]
    fn splits_clustered_flags() {
        let directives = parse(&argv("-gs")).unwrap();
        assert_eq!(
            directives,
            vec![Directive::GetStatus, Directive::ListDevices]
        );
    }

    #[test]
    fn reads_attached_values() {
        let directives = parse(&argv("-o2 -t=3")).unwrap();
        assert_eq!(directives, vec![Directive::SwitchOn(2), Directive::Toggle(3)]);
    }

    #[test]
    fn cluster_may_end_in_valued_option() {
        let directives = parse(&argv("-go 2")).unwrap();
        assert_eq!(directives, vec![Directive::GetStatus, Directive::SwitchOn(2)]);
    }

    #[test]
    fn accepts_negative_numbers() {
        let directives = parse(&argv("-d -1 -o -4")).unwrap();
        assert_eq!(
            directives,
            vec![Directive::SelectByIndex(-1), Directive::SwitchOn(-4)]
        );
    }

    #[test]
    fn repeated_options_stay_repeated() {
        let directives = parse(&argv("-g -g -t 1 -t 1")).unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::GetStatus,
                Directive::GetStatus,
                Directive::Toggle(1),
                Directive::Toggle(1),
            ]
        );
    }

    #[test]
    fn rejects_unknown_option() {
        let err = parse(&argv("-z")).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn rejects_missing_value() {
        assert!(parse(&argv("-o")).is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse(&argv("-o nine")).is_err());
    }

    #[test]
    fn empty_command_line_parses_to_nothing() {
        assert!(parse(&argv("")).unwrap().is_empty());
    }

    #[test]
    fn usage_names_every_option() {
        let usage = usage();
        for needle in [
            "select device by identifier",
            "select device by registry index",
            "switch outlet off",
            "print status",
            "print usage",
            "detach kernel driver",
            "switch outlet on",
            "list devices",
            "toggle outlet",
        ] {
            assert!(usage.contains(needle), "missing {needle:?} in:\n{usage}");
        }
    }
}
