//! Member fields that may be changed in place on an active record

use std::str::FromStr;

use crate::error::StoreError;
use crate::member::Member;

/// Text fields accepted by `set_text_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Name,
    Street,
    City,
    Zipcode,
    Country,
    Phone,
    /// Write-once: may only be set while empty
    Username,
}

/// Boolean fields accepted by `set_bool_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolField {
    HasKey,
    EmailVerified,
}

/// Integer fields accepted by `set_long_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongField {
    PaymentsCaughtUpTo,
}

fn unknown(field: &str) -> StoreError {
    StoreError::NotFound(format!("unknown field specified: {field}"))
}

impl TextField {
    /// Column name in both backends
    pub fn column(self) -> &'static str {
        match self {
            TextField::Name => "name",
            TextField::Street => "street",
            TextField::City => "city",
            TextField::Zipcode => "zipcode",
            TextField::Country => "country",
            TextField::Phone => "phone",
            TextField::Username => "username",
        }
    }

    /// Write `value` into `member`, enforcing the username rule
    pub fn apply(self, member: &mut Member, value: &str) -> Result<(), StoreError> {
        let value = value.to_string();
        match self {
            TextField::Name => member.name = value,
            TextField::Street => member.street = value,
            TextField::City => member.city = value,
            TextField::Zipcode => member.zipcode = value,
            TextField::Country => member.country = value,
            TextField::Phone => member.phone = value,
            TextField::Username => {
                if member.has_username() {
                    return Err(StoreError::FailedPrecondition(
                        "cannot modify user name once set".to_string(),
                    ));
                }
                member.username = Some(value);
            }
        }
        Ok(())
    }
}

impl FromStr for TextField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "name" => TextField::Name,
            "street" => TextField::Street,
            "city" => TextField::City,
            "zipcode" => TextField::Zipcode,
            "country" => TextField::Country,
            "phone" => TextField::Phone,
            "username" => TextField::Username,
            other => return Err(unknown(other)),
        })
    }
}

impl BoolField {
    pub fn column(self) -> &'static str {
        match self {
            BoolField::HasKey => "has_key",
            BoolField::EmailVerified => "email_verified",
        }
    }

    pub fn apply(self, member: &mut Member, value: bool) {
        match self {
            BoolField::HasKey => member.has_key = value,
            BoolField::EmailVerified => member.email_verified = value,
        }
    }
}

impl FromStr for BoolField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "has_key" => Ok(BoolField::HasKey),
            "email_verified" => Ok(BoolField::EmailVerified),
            other => Err(unknown(other)),
        }
    }
}

impl LongField {
    pub fn column(self) -> &'static str {
        match self {
            LongField::PaymentsCaughtUpTo => "payments_caught_up_to",
        }
    }

    pub fn apply(self, member: &mut Member, value: u64) {
        match self {
            LongField::PaymentsCaughtUpTo => member.payments_caught_up_to = Some(value),
        }
    }
}

impl FromStr for LongField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payments_caught_up_to" => Ok(LongField::PaymentsCaughtUpTo),
            other => Err(unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_unknown_field_is_not_found() {
        let err = "email".parse::<TextField>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!("fee".parse::<LongField>().unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!("admin".parse::<BoolField>().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_username_is_write_once() {
        let mut member = Member::default();
        TextField::Username.apply(&mut member, "ada").unwrap();
        assert_eq!(member.username.as_deref(), Some("ada"));

        let err = TextField::Username.apply(&mut member, "countess").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(member.username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_empty_username_can_be_replaced() {
        let mut member = Member {
            username: Some(String::new()),
            ..Default::default()
        };
        TextField::Username.apply(&mut member, "ada").unwrap();
        assert_eq!(member.username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_apply_flags_and_longs() {
        let mut member = Member::default();
        BoolField::HasKey.apply(&mut member, true);
        LongField::PaymentsCaughtUpTo.apply(&mut member, 1_700_000_000);
        assert!(member.has_key);
        assert_eq!(member.payments_caught_up_to, Some(1_700_000_000));
    }
}
