use crate::error::PrefixError;
use ipnet::IpNet;
use std::net::IpAddr;

/// Network used to scope a bulk read.
///
/// An explicit `arg` wins and may be a CIDR or a bare address. Otherwise the
/// smallest network covering every address is returned. Addresses of mixed
/// families have no common network and yield `None`, as does an empty list.
pub fn calc_prefix(arg: Option<&str>, addresses: &[IpAddr]) -> Result<Option<IpNet>, PrefixError> {
    if let Some(arg) = arg.map(str::trim).filter(|arg| !arg.is_empty()) {
        return parse_network(arg).map(Some);
    }

    let Some((first, rest)) = addresses.split_first() else {
        return Ok(None);
    };
    let (base, width) = bits(first);
    let mut common = width;
    for address in rest {
        let (value, other_width) = bits(address);
        if other_width != width {
            return Ok(None);
        }
        let differing = base ^ value;
        // Values are left aligned in a u128 so leading zeros count prefix bits.
        common = common.min(differing.leading_zeros().min(width));
    }

    IpNet::new(*first, common as u8).map(|network| Some(network.trunc())).map_err(|_| PrefixError::Invalid(first.to_string()))
}

/// Accepts `10.0.0.0/24` as well as `10.0.0.5`, the latter as a host network.
pub fn parse_network(arg: &str) -> Result<IpNet, PrefixError> {
    if let Ok(network) = arg.parse::<IpNet>() {
        return Ok(network);
    }
    let address = arg.parse::<IpAddr>().map_err(|_| PrefixError::Invalid(arg.to_string()))?;
    IpNet::new(address, bits(&address).1 as u8).map_err(|_| PrefixError::Invalid(arg.to_string()))
}

fn bits(address: &IpAddr) -> (u128, u32) {
    match address {
        IpAddr::V4(v4) => ((u32::from(*v4) as u128) << 96, 32),
        IpAddr::V6(v6) => (u128::from(*v6), 128),
    }
}
