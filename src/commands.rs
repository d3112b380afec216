//! This module defines the `Command` enum and its associated methods for parsing
//! and handling user commands in the disk image analysis tool.
//!
//! The `Command` enum represents the commands a user can type at the prompt,
//! such as opening an image, printing its layout, walking or hashing its
//! filesystems, and handling invalid or unknown input.

/// Represents a user command in the disk image analysis tool.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Command to quit the program.
    Quit,
    /// Command to open a disk image, encapsulating its locator as a `String`.
    Open(String),
    /// Command to print the block layout of the open image.
    Print,
    /// Select the filesystem to inspect (1-based, in disk order).
    Partition(u8),
    /// Print the entry tree of the selected filesystem, or of all of them.
    Tree,
    /// List one folder, given its path from the filesystem root.
    List(String),
    /// Hash every readable file with SHA-256.
    Hash,
    /// Skip the strict boot sector validation on the next `open`.
    Skip,
    /// Command for an unknown input, encapsulating the raw input as a `String`.
    Unknown(String),
    /// Command for invalid input, encapsulating an error message as a `String`.
    Invalid(String),
    /// Command for an empty input.
    Empty,
}

impl Command {
    /// Parses a string into a `Command` instance.
    ///
    /// # Parameters
    /// - `s`: A string slice representing the user input.
    ///
    /// # Returns
    /// - `Command::Quit` if the input is "quit".
    /// - `Command::Open` with the locator if the input starts with "open" followed by an argument.
    /// - `Command::Print` if the input is "print".
    /// - `Command::Partition` if the input is "part" followed by a number.
    /// - `Command::Tree` if the input is "tree".
    /// - `Command::List` if the input is "ls", with "/" when no path is given.
    /// - `Command::Hash` if the input is "hash".
    /// - `Command::Skip` if the input is "skip".
    /// - `Command::Unknown` if the input does not match any known command.
    /// - `Command::Invalid` if an argument is missing or malformed.
    /// - `Command::Empty` if the input is empty or contains only whitespace.
    pub fn from_string(s: &str) -> Self {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("quit") => Command::Quit,
            Some("open") => match parts.next() {
                Some(arg) => Command::Open(arg.to_string()),
                None => Command::Invalid(String::from(
                    "Missing arg: 'open' expects the path to a disk image.",
                )),
            },
            Some("print") => Command::Print,
            Some("part") => match parts.next() {
                Some(arg) => match arg.parse::<u8>() {
                    Ok(nb) => Command::Partition(nb),
                    Err(_) => Command::Invalid(String::from(
                        "Arg parsing error: 'part' expects an unsigned integer.",
                    )),
                },
                None => Command::Invalid(String::from(
                    "Missing arg: 'part' expects the filesystem number.",
                )),
            },
            Some("tree") => Command::Tree,
            Some("ls") => Command::List(parts.next().unwrap_or("/").to_string()),
            Some("hash") => Command::Hash,
            Some("skip") => Command::Skip,
            Some(other) => Command::Unknown(other.to_string()),
            None => Command::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arguments() {
        assert_eq!(Command::from_string("open disk.dd\n"), Command::Open("disk.dd".into()));
        assert_eq!(Command::from_string("part 2"), Command::Partition(2));
        assert_eq!(Command::from_string("ls"), Command::List("/".into()));
        assert_eq!(Command::from_string("ls /docs"), Command::List("/docs".into()));
        assert_eq!(Command::from_string("   "), Command::Empty);
    }

    #[test]
    fn reports_bad_input() {
        assert!(matches!(Command::from_string("open"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("part x"), Command::Invalid(_)));
        assert_eq!(Command::from_string("format"), Command::Unknown("format".into()));
    }
}
