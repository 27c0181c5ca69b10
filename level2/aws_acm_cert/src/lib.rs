//! This module defines and creates an AWS ACM certificate. This module only works if the following is true:
//! - The domain you'd like to get a certificate for is hosted in Amazon Route 53
//! - The domain resides in your AWS account.
//! - You are using DNS validation.
//!
//! Certificates used by cloudfront must be created in us-east-1.

use aws_cfn_stack::{logical_name, Error, Resource};
use serde::Serialize;

#[derive(Default)]
pub struct Input {
    /// the domain you're requesting a certificate for. Must be fully qualified. Can have 1 optional wildcard.
    /// Examples of valid values:
    /// - www.mysite.com
    /// - multiple.sub.domains.mysite.com
    /// - mysite.com
    /// - *.mysite.com
    /// Examples of invalid values:
    /// - *.something.*.mysite.com
    /// - cannotendwithdot.com.
    pub domain_name: String,

    /// The hosted zone ID of where your domain is hosted in Route53.
    /// Must be provided as the actual ID without the `/hostedzone/` prefix.
    pub hosted_zone_id: String,

    pub subject_alternative_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    /// this is the logical name in cloudformation for your cert.
    /// Reference this name in other resources that rely on it,
    /// for example, a cloudfront distribution that wants to reference the cert ARN.
    pub logical_cert_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DomainValidationOption {
    pub domain_name: String,
    pub hosted_zone_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnCertificate {
    pub domain_name: String,
    pub validation_method: String,
    pub domain_validation_options: Vec<DomainValidationOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subject_alternative_names: Vec<String>,
}

aws_cfn_stack::impl_cfn_resource!(CfnCertificate, "AWS::CertificateManager::Certificate");

pub fn validate_domain_name(domain_name: &str) -> Result<(), Error> {
    if domain_name.is_empty() {
        return Err(Error::InvalidInput("Must provide a domain name".to_string()));
    }
    if domain_name.ends_with('.') {
        return Err(Error::InvalidInput(format!("Domain name must not end with a '.'. {} is invalid.", domain_name)));
    }
    if domain_name.contains('*') {
        if domain_name.matches('*').count() > 1 {
            return Err(Error::InvalidInput(format!("Must only provide 1 wildcard. {} is invalid.", domain_name)));
        }
        if !domain_name.starts_with("*.") {
            return Err(Error::InvalidInput(format!(
                "If using a wildcard, it must be the first component of your domain, eg: \"*.something.com\". {} is invalid.", domain_name
            )));
        }
    }
    if domain_name.split('.').any(|label| label.is_empty()) || !domain_name.contains('.') {
        return Err(Error::InvalidInput(format!("{} is not a fully qualified domain name", domain_name)));
    }
    Ok(())
}

pub fn validate_hosted_zone_id(hosted_zone_id: &str) -> Result<(), Error> {
    if hosted_zone_id.is_empty() {
        return Err(Error::InvalidInput("Must provide the hosted zone ID of where your domain resides".to_string()));
    }
    if hosted_zone_id.starts_with("/hostedzone/") {
        return Err(Error::InvalidInput(format!(
            "Hosted zone ID {} must be provided without the /hostedzone/ prefix", hosted_zone_id
        )));
    }
    Ok(())
}

pub fn config(input: &Input, stack: &mut aws_cfn_stack::Input) -> Result<Outputs, Error> {
    validate_domain_name(&input.domain_name)?;
    validate_hosted_zone_id(&input.hosted_zone_id)?;
    for name in input.subject_alternative_names.iter() {
        validate_domain_name(name)?;
    }
    let domain_validation_options = std::iter::once(&input.domain_name)
        .chain(input.subject_alternative_names.iter())
        .map(|domain_name| DomainValidationOption {
            domain_name: domain_name.clone(),
            hosted_zone_id: input.hosted_zone_id.clone(),
        })
        .collect();
    let cert = CfnCertificate {
        domain_name: input.domain_name.clone(),
        validation_method: "DNS".to_string(),
        domain_validation_options,
        subject_alternative_names: input.subject_alternative_names.clone(),
    };
    let logical_cert_name = logical_name("Certificate", &input.domain_name)?;
    stack.push(Resource::new(logical_cert_name.clone(), cert));
    Ok(Outputs { logical_cert_name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rules() {
        assert!(validate_domain_name("*.mysite.com").is_ok());
        assert!(validate_domain_name("multiple.sub.domains.mysite.com").is_ok());
        assert!(validate_domain_name("*.something.*.mysite.com").is_err());
        assert!(validate_domain_name("www.*.mysite.com").is_err());
        assert!(validate_domain_name("cannotendwithdot.com.").is_err());
        assert!(validate_domain_name("localhost").is_err());
        assert!(validate_domain_name("").is_err());
    }

    #[test]
    fn hosted_zone_must_be_bare_id() {
        assert!(validate_hosted_zone_id("Z0123456789ABC").is_ok());
        assert!(validate_hosted_zone_id("/hostedzone/Z0123456789ABC").is_err());
        assert!(validate_hosted_zone_id("").is_err());
    }

    #[test]
    fn emits_dns_validation_in_the_hosted_zone() {
        let mut stack = aws_cfn_stack::Input::default();
        let input = Input {
            domain_name: "new.mayoche.info".into(),
            hosted_zone_id: "Z0123456789ABC".into(),
            ..Default::default()
        };
        let out = config(&input, &mut stack).unwrap();
        assert_eq!(out.logical_cert_name, "Certificatenewmayocheinfo");
        let synth = aws_cfn_stack::synthesize(stack, "test").unwrap();
        let cert = synth.resource(&out.logical_cert_name).unwrap();
        assert_eq!(cert.ty, "AWS::CertificateManager::Certificate");
        assert_eq!(cert.properties["ValidationMethod"], "DNS");
        assert_eq!(cert.properties["DomainValidationOptions"][0]["HostedZoneId"], "Z0123456789ABC");
        assert_eq!(cert.properties["DomainValidationOptions"][0]["DomainName"], "new.mayoche.info");
        assert!(cert.properties.get("SubjectAlternativeNames").is_none());
    }
}
