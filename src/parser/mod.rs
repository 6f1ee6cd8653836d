//! Text parsers for the management tools' output formats.
//!
//! Parsers are pure: a malformed line or block is logged and skipped, it
//! never aborts parsing of the remaining input.

pub mod audio;
pub mod bluetooth;
pub mod wifi;

/// Whether `s` looks like `AA:BB:CC:DD:EE:FF`.
pub fn is_hw_address(s: &str) -> bool {
   let bytes = s.as_bytes();
   bytes.len() == 17
      && bytes.iter().enumerate().all(|(i, &b)| {
         if i % 3 == 2 {
            b == b':'
         } else {
            b.is_ascii_hexdigit()
         }
      })
}

/// Splits a terse (`-t`) nmcli row on unescaped colons, unescaping `\:` and `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
   let mut fields = Vec::new();
   let mut current = String::new();
   let mut chars = line.chars();
   while let Some(c) = chars.next() {
      match c {
         '\\' => match chars.next() {
            Some(next @ (':' | '\\')) => current.push(next),
            Some(other) => {
               current.push('\\');
               current.push(other);
            },
            None => current.push('\\'),
         },
         ':' => fields.push(std::mem::take(&mut current)),
         _ => current.push(c),
      }
   }
   fields.push(current);
   fields
}
