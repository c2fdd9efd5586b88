use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use wire::Color;

/// Run screen programs in a sandbox and work with the screen wire protocol
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// Host configuration file (TOML)
    #[clap(short = 'c', long = "config", env = "SCREENJOBS_CONFIG")]
    pub config: Option<PathBuf>,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// run a program once in a fresh job and print its run log
    Run {
        #[clap(long)]
        /// program to run as the job's entry file
        file: PathBuf,

        #[clap(long)]
        /// give the job the shared screen instead of a simulation
        hardware: bool,

        #[clap(long = "max-runtime")]
        /// seconds before the run is killed
        max_runtime: Option<u64>,
    },
    /// decode one frame
    Decode {
        /// frame bytes as hex, e.g. 15000aff0000
        frame: HexBytes,
    },
    /// print the hex encoding of a frame
    Encode {
        #[clap(subcommand)]
        frame: EncodeFrame,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum EncodeFrame {
    /// fill the whole screen
    Fill {
        #[clap(parse(try_from_str = parse_color))]
        color: Color,
    },
    /// set one pixel
    SetPixel {
        index: u16,
        #[clap(parse(try_from_str = parse_color))]
        color: Color,
    },
    /// clear to black
    Clear,
    /// show what has been drawn
    Render,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if !digits.is_ascii() || digits.len() % 2 != 0 {
            return Err("Required format is an even number of hex digits".to_string());
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map_err(|_| format!("not hex: {}", &digits[i..i + 2]))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(HexBytes)
    }
}

/// try_from_str parse function for `#RRGGBB`, `0xRRGGBB` or `RRGGBB`
fn parse_color(s: &str) -> Result<Color, String> {
    let digits = s
        .strip_prefix('#')
        .or_else(|| s.strip_prefix("0x"))
        .unwrap_or(s);
    match u32::from_str_radix(digits, 16) {
        Ok(rgb) if rgb <= 0xFFFFFF => Ok(Color::new(rgb)),
        _ => Err("Required format is #RRGGBB".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags() {
        let args =
            ArgParser::parse_from(["screenctl", "run", "--file", "main.py", "--max-runtime", "5"]);
        assert_eq!(args.config, None);
        assert_eq!(
            args.sub_command,
            SubCommand::Run {
                file: PathBuf::from("main.py"),
                hardware: false,
                max_runtime: Some(5),
            }
        );
    }

    #[test]
    fn encode_set_pixel() {
        let args = ArgParser::parse_from(["screenctl", "encode", "set-pixel", "10", "#ff0000"]);
        assert_eq!(
            args.sub_command,
            SubCommand::Encode {
                frame: EncodeFrame::SetPixel {
                    index: 10,
                    color: Color::new(0xFF0000),
                }
            }
        );
    }

    #[test]
    fn hex_and_colors() {
        assert_eq!("15 000a".parse(), Ok(HexBytes(vec![0x15, 0x00, 0x0A])));
        assert!("150".parse::<HexBytes>().is_err());
        assert!("zz".parse::<HexBytes>().is_err());
        assert_eq!(parse_color("0x00ff00"), Ok(Color::new(0x00FF00)));
        assert!(parse_color("1000000").is_err());
    }
}
