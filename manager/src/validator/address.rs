//! Address forms reported by `<node> debug addr`.

use serde::Serialize;

/// One key in every encoding the chain uses.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AddressForms {
    /// Upper-case hex as printed by the node.
    pub hex: String,
    /// 0x-prefixed lower-case hex.
    pub evm: String,
    pub account: String,
    pub operator: String,
    pub consensus: String,
}

/// Line-scans `debug addr` output:
///
/// ```text
/// Address: [38 77 ...]
/// Address (hex): 264D...
/// Bech32 Acc: push1ye...
/// Bech32 Val: pushvaloper1ye...
/// Bech32 Con: pushvalcons1ye...
/// ```
///
/// Returns `None` unless the hex field is present.
pub fn parse_debug_addr(output: &str) -> Option<AddressForms> {
    let mut forms = AddressForms::default();
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match label.trim() {
            "Address (hex)" => forms.hex = value,
            "Bech32 Acc" => forms.account = value,
            "Bech32 Val" => forms.operator = value,
            "Bech32 Con" => forms.consensus = value,
            _ => {}
        }
    }
    if forms.hex.is_empty() || !forms.hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    forms.evm = to_evm(&forms.hex);
    Some(forms)
}

/// `264DAB` -> `0x264dab`
pub fn to_evm(hex: &str) -> String {
    format!("0x{}", hex.trim_start_matches("0x").to_ascii_lowercase())
}

/// `debug addr` accepts bech32 or bare hex; strip an EVM prefix.
pub fn debug_addr_input(addr: &str) -> &str {
    addr.strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr)
}
