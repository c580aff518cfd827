// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Atomic text zonefile writing

use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;

use tempfile::Builder;
use tracing::debug;

use crate::content::ZoneContents;
use crate::error::{ZoneErrorKind, ZoneResult};
use crate::proto::rr::RecordType;

/// Writes the zone as a master-file text dump to `path`, atomically.
///
/// The dump goes to a temporary file in the target directory first (created
/// mode 0600, widened to 0640 once complete), is flushed to disk, and then
/// renamed over the final path, so the on-disk zonefile is never partial. On
/// any failure before the rename the temporary file is removed and the
/// previous zonefile is left untouched.
///
/// Returns the modification time of the freshly written file.
pub fn write_zonefile(contents: &ZoneContents, path: &Path) -> ZoneResult<SystemTime> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(ZoneErrorKind::InvalidArgument("zonefile path has no file name"))?;

    debug!("writing zone {} to {}", contents.origin(), path.display());

    let temp = Builder::new().prefix(file_name).tempfile_in(dir)?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        dump(contents, &mut writer)?;
        writer.flush()?;
    }

    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        temp.as_file().set_permissions(Permissions::from_mode(0o640))?;
    }

    let file = temp
        .persist(path)
        .map_err(|persist| ZoneErrorKind::Io(persist.error))?;

    let mtime = file.metadata()?.modified()?;
    Ok(mtime)
}

fn dump<W: Write>(contents: &ZoneContents, out: &mut W) -> io::Result<()> {
    writeln!(out, "$ORIGIN {}", contents.origin())?;

    // the SOA leads the file
    if let Some(soa) = contents.soa_record() {
        writeln!(out, "{soa}")?;
    }

    for (key, rrset) in contents.records() {
        if key.record_type == RecordType::SOA {
            continue;
        }

        for record in rrset.records_without_rrsigs() {
            writeln!(out, "{record}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use crate::proto::rr::rdata::SOA;
    use crate::proto::rr::{LowerName, Name, RData, Record, RecordSet, RrKey};

    use super::*;

    fn contents(serial: u32) -> ZoneContents {
        let origin = Name::from_str("example.com.").unwrap();
        let mut records = BTreeMap::new();

        let mut soa = RecordSet::new(&origin, RecordType::SOA, 0);
        soa.insert(
            Record::from_rdata(
                origin.clone(),
                3600,
                RData::SOA(SOA::new(
                    Name::from_str("ns1.example.com.").unwrap(),
                    Name::from_str("admin.example.com.").unwrap(),
                    serial,
                    7200,
                    1800,
                    1_209_600,
                    300,
                )),
            ),
            0,
        );
        records.insert(
            RrKey::new(LowerName::from(&origin), RecordType::SOA),
            soa,
        );

        let www = Name::from_str("www.example.com.").unwrap();
        let mut a = RecordSet::new(&www, RecordType::A, 0);
        a.insert(
            Record::from_rdata(www.clone(), 300, RData::A(Ipv4Addr::new(192, 0, 2, 1).into())),
            0,
        );
        records.insert(RrKey::new(LowerName::from(&www), RecordType::A), a);

        ZoneContents::new(origin, records).unwrap()
    }

    #[test]
    fn test_write_zonefile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.zone");

        write_zonefile(&contents(100), &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("$ORIGIN example.com."));
        assert!(text.contains("www.example.com."));
        // the SOA leads the records
        let soa_pos = text.find("SOA").unwrap();
        let a_pos = text.find(" A ").unwrap();
        assert!(soa_pos < a_pos);
    }

    #[test]
    fn test_rewrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.zone");

        write_zonefile(&contents(100), &path).unwrap();
        write_zonefile(&contents(101), &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("101"));
        assert!(!text.contains("100 7200"));

        // no temporary files left behind
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_zonefile_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com.zone");
        write_zonefile(&contents(100), &path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
