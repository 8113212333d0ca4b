//! Banner templates written to the session channel.
//!
//! The channel is never put into cooked mode (no pty is ever granted), so
//! every newline must be followed by a carriage return to render sanely in
//! the client's terminal.

use std::sync::LazyLock;

const HELLO_TEMPLATE: &str = r#"
    +---------------------------------------------------------------------+
    |                                                                     |
    |             _o/ Hello {name}!
    |                                                                     |
    |                                                                     |
    |  Did you know that ssh offers all of your public keys to any        |
    |  server it tries to log in to?                                      |
    |                                                                     |
    |  That's how this server knows you are @{user} on GitHub!
    |                                                                     |
    |  GitHub publishes every user's public ssh keys, so matching the     |
    |  keys your client just offered is all it takes. Yours are at        |
    |  https://github.com/{user}.keys
    |                                                                     |
    |  Nothing was stored and no login took place. Safe travels!          |
    |                                                                     |
    +---------------------------------------------------------------------+

"#;

const FAILED_TEMPLATE: &str = r#"
    +---------------------------------------------------------------------+
    |                                                                     |
    |             _o/ Hello!                                              |
    |                                                                     |
    |                                                                     |
    |  Did you know that ssh offers all of your public keys to any        |
    |  server it tries to log in to? You can see yours echoed below.      |
    |                                                                     |
    |  We tried to use them to look up your GitHub account,               |
    |  but got no match :(                                                |
    |                                                                     |
    |  Nothing was stored and no login took place. Safe travels!          |
    |                                                                     |
    +---------------------------------------------------------------------+

"#;

const AGENT_TEMPLATE: &str = r#"
                      ***** WARNING ***** WARNING *****

           You have SSH agent forwarding turned (universally?) on.
         That is a VERY BAD idea. For example, right now this server
          has access to your agent and can use your keys however it
                    likes as long as you are connected.

               ANY SERVER YOU LOG IN TO AND ANYONE WITH ROOT ON
                   THOSE SERVERS CAN LOGIN AS YOU ANYWHERE.

                   Consider ForwardAgent no, plus per-host
                        overrides where you need it.
"#;

const X11_TEMPLATE: &str = r#"
                      ***** WARNING ***** WARNING *****

               You have X11 forwarding turned (universally?) on.
          That is a VERY BAD idea. For example, right now this server
              has access to your desktop, windows, and keystrokes
                         as long as you are connected.

                ANY SERVER YOU LOG IN TO AND ANYONE WITH ROOT ON
         THOSE SERVERS CAN SNIFF YOUR KEYSTROKES AND ACCESS YOUR WINDOWS.
"#;

const ROAMING_TEMPLATE: &str = r#"
                      ***** WARNING ***** WARNING *****

    You have roaming turned on. If you are using OpenSSH, that most likely
       means you are vulnerable to the CVE-2016-0777 information leak.

   THIS MEANS THAT ANY SERVER YOU CONNECT TO MIGHT OBTAIN YOUR PRIVATE KEYS.

     Add "UseRoaming no" to the "Host *" section of your ~/.ssh/config or
           /etc/ssh/ssh_config file, rotate keys and update ASAP.
"#;

/// Failed-lookup banner, CRLF-rewritten once at first use.
pub static FAILED_MSG: LazyLock<String> = LazyLock::new(|| crlf(FAILED_TEMPLATE));

/// Agent-forwarding warning.
pub static AGENT_MSG: LazyLock<String> = LazyLock::new(|| crlf(AGENT_TEMPLATE));

/// X11-forwarding warning.
pub static X11_MSG: LazyLock<String> = LazyLock::new(|| crlf(X11_TEMPLATE));

/// Roaming (CVE-2016-0777) warning.
pub static ROAMING_MSG: LazyLock<String> = LazyLock::new(|| crlf(ROAMING_TEMPLATE));

/// Rewrite `\n` to `\n\r` so the text renders on a raw channel.
fn crlf(s: &str) -> String {
    s.replace('\n', "\n\r")
}

/// Render the hello banner for an identified visitor.
///
/// `name` is the display name (or `@login` when GitHub has none); `user` is
/// the GitHub login used in the URLs.
pub fn hello(name: &str, user: &str) -> String {
    crlf(&HELLO_TEMPLATE.replace("{name}", name).replace("{user}", user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_substitutes_both_fields() {
        let out = hello("Alice A.", "alice");
        assert!(out.contains("Hello Alice A.!"));
        assert!(out.contains("you are @alice on GitHub"));
        assert!(out.contains("https://github.com/alice.keys"));
        assert!(!out.contains("{name}"));
        assert!(!out.contains("{user}"));
    }

    #[test]
    fn every_newline_is_followed_by_carriage_return() {
        for msg in [
            hello("x", "y"),
            FAILED_MSG.clone(),
            AGENT_MSG.clone(),
            X11_MSG.clone(),
            ROAMING_MSG.clone(),
        ] {
            let bytes = msg.as_bytes();
            for (i, b) in bytes.iter().enumerate() {
                if *b == b'\n' {
                    assert_eq!(bytes.get(i + 1), Some(&b'\r'), "bare newline in banner");
                }
            }
        }
    }
}
