use aws_cfn_stack::{logical_name, Error, Resource, StrVal};
use serde::Serialize;

pub struct Input {
    /// eg: `new.mayoche.info`. a trailing `.` is added if missing.
    pub record_name: String,
    /// preferred over `hosted_zone_name` when both are set.
    pub hosted_zone_id: String,
    /// if both this and the id are left empty, we guess the zone
    /// from the last two components of the record name.
    pub hosted_zone_name: String,
    /// what the CNAME points at. usually the `DomainName` attribute
    /// of a distribution.
    pub target: StrVal,
    /// Defaults to 1800.
    pub ttl_secs: u32,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            record_name: String::new(),
            hosted_zone_id: String::new(),
            hosted_zone_name: String::new(),
            target: StrVal::default(),
            ttl_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    pub logical_record_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnRecordSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_zone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_zone_name: Option<String>,
    pub name: String,
    #[serde(rename = "Type")]
    pub record_type: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub resource_records: Vec<StrVal>,
    pub comment: String,
}

aws_cfn_stack::impl_cfn_resource!(CfnRecordSet, "AWS::Route53::RecordSet");

fn with_trailing_dot(name: &str) -> String {
    let mut out = name.to_string();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// try to guess hosted zone name based on the record name
pub fn guess_hosted_zone_name(record_name: &str) -> Result<String, Error> {
    let name_components: Vec<&str> = record_name.trim_end_matches('.').split('.').collect();
    if name_components.len() < 2 || name_components.iter().any(|c| c.is_empty()) {
        return Err(Error::InvalidInput(format!(
            "Invalid name for route53 record set {record_name:?}. Must be a domain, eg: mysubdomain.mywebsite.com"
        )));
    }
    let last_two = &name_components[name_components.len() - 2..];
    Ok(with_trailing_dot(&last_two.join(".")))
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    if input.record_name.is_empty() {
        return Err(Error::InvalidInput("Route53 record must have a name. Example mysubdomain.mywebsite.com".to_string()));
    }
    if input.target.is_empty() {
        return Err(Error::InvalidInput(format!("Route53 record {} must have a target", input.record_name)));
    }
    let (hosted_zone_id, hosted_zone_name) = if !input.hosted_zone_id.is_empty() {
        (Some(input.hosted_zone_id.clone()), None)
    } else if !input.hosted_zone_name.is_empty() {
        (None, Some(with_trailing_dot(&input.hosted_zone_name)))
    } else {
        (None, Some(guess_hosted_zone_name(&input.record_name)?))
    };
    let record = CfnRecordSet {
        hosted_zone_id,
        hosted_zone_name,
        name: with_trailing_dot(&input.record_name),
        record_type: "CNAME".to_string(),
        ttl: input.ttl_secs.to_string(),
        resource_records: vec![input.target.clone()],
        comment: input.record_name.clone(),
    };
    let logical_record_name = logical_name("Record", &input.record_name)?;
    stack.push(Resource::new(logical_record_name.clone(), record));
    Ok(Outputs { logical_record_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_cfn_stack::get_att;

    #[test]
    fn guesses_zone_from_record() {
        assert_eq!(guess_hosted_zone_name("new.mayoche.info").unwrap(), "mayoche.info.");
        assert_eq!(guess_hosted_zone_name("a.b.c.example.com.").unwrap(), "example.com.");
        assert!(guess_hosted_zone_name("localhost").is_err());
    }

    #[test]
    fn cname_to_distribution() {
        let mut stack = aws_cfn_stack::Input::default();
        let input = Input {
            record_name: "new.mayoche.info".into(),
            hosted_zone_id: "Z0123456789ABC".into(),
            target: get_att("Distributionweb", "DomainName").into(),
            ..Default::default()
        };
        let out = config(&input, &mut stack).unwrap();
        assert_eq!(out.logical_record_name, "Recordnewmayocheinfo");
        let props = stack.resources[0].properties.properties().unwrap();
        assert_eq!(props["Type"], "CNAME");
        assert_eq!(props["TTL"], "1800");
        assert_eq!(props["Name"], "new.mayoche.info.");
        assert_eq!(props["HostedZoneId"], "Z0123456789ABC");
        assert!(props.get("HostedZoneName").is_none());
        assert_eq!(props["ResourceRecords"][0]["Fn::GetAtt"][1], "DomainName");
    }

    #[test]
    fn falls_back_to_zone_name() {
        let mut stack = aws_cfn_stack::Input::default();
        let input = Input { record_name: "www.example.com".into(), target: "d111.cloudfront.net".into(), ..Default::default() };
        config(&input, &mut stack).unwrap();
        assert_eq!(stack.resources[0].properties.properties().unwrap()["HostedZoneName"], "example.com.");
        assert!(config(&Input { record_name: "x.example.com".into(), ..Default::default() }, &mut stack).is_err());
    }
}
