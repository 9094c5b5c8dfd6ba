//! Step Matcher: relaxed equality between an observed frontend
//! message and the one recorded in a script, so a replay survives a driver
//! that picks fresh statement/portal names on every run.

use pq_proto::FrontendMessage;

/// `Ok(())` on a match, `Err(diagnostic)` otherwise. The diagnostic string
/// is embedded verbatim in the injected `ErrorResponse`.
pub fn match_step(got: &FrontendMessage, want: &FrontendMessage) -> Result<(), String> {
    use FrontendMessage::*;

    match (got, want) {
        (Parse(g), Parse(w)) => {
            if g.query != w.query {
                return Err(field_mismatch("query", &g.query, &w.query));
            }
            if g.parameter_oids != w.parameter_oids {
                return Err(field_mismatch(
                    "parameter oids",
                    &format!("{:?}", g.parameter_oids),
                    &format!("{:?}", w.parameter_oids),
                ));
            }
            Ok(())
        }
        (Describe(g), Describe(w)) => {
            if g.object_type != w.object_type {
                return Err(field_mismatch(
                    "object type",
                    &format!("{:?}", g.object_type),
                    &format!("{:?}", w.object_type),
                ));
            }
            Ok(())
        }
        (Bind(g), Bind(w)) => {
            if g.destination_portal != w.destination_portal {
                return Err(field_mismatch(
                    "destination portal",
                    &g.destination_portal,
                    &w.destination_portal,
                ));
            }
            if g.parameter_format_codes != w.parameter_format_codes {
                return Err(field_mismatch(
                    "parameter format codes",
                    &format!("{:?}", g.parameter_format_codes),
                    &format!("{:?}", w.parameter_format_codes),
                ));
            }
            if !parameters_equal(&g.parameters, &w.parameters) {
                return Err(field_mismatch(
                    "parameters",
                    &format!("{:?}", g.parameters),
                    &format!("{:?}", w.parameters),
                ));
            }
            if g.result_format_codes != w.result_format_codes {
                return Err(field_mismatch(
                    "result format codes",
                    &format!("{:?}", g.result_format_codes),
                    &format!("{:?}", w.result_format_codes),
                ));
            }
            Ok(())
        }
        (g, w) if g.type_name() != w.type_name() => Err(format!(
            "msg => {}, want => {}",
            g.type_name(),
            w.type_name()
        )),
        (g, w) if g == w => Ok(()),
        (g, w) => Err(format!(
            "msg => {:?}, want => {:?}",
            g, w
        )),
    }
}

/// Empty and absent parameter lists compare equal -- some drivers omit the
/// `Parameters` array entirely for a zero-arg `Bind`, others send an empty one.
fn parameters_equal(a: &[Option<Vec<u8>>], b: &[Option<Vec<u8>>]) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    a == b
}

fn field_mismatch(field: &str, got: &str, want: &str) -> String {
    format!("msg => {field}: {got}, want => {field}: {want}")
}
