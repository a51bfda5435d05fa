//! Mention types and the relation vocabulary
//!
//! The canonical label set holds the `per:` and `org:` relations. The
//! `gpe:` labels and `org:organizations_founded` only appear as inverses of
//! canonical labels; on input they are rewritten into canonical form by
//! swapping arguments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::KbpoError;

// ============================================================================
// Mention Types
// ============================================================================

/// Type of a mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MentionType {
    #[serde(rename = "PER")]
    Per,
    #[serde(rename = "ORG")]
    Org,
    #[serde(rename = "GPE")]
    Gpe,
    #[serde(rename = "TITLE")]
    Title,
    #[serde(rename = "DATE")]
    Date,
}

impl MentionType {
    pub const ALL: [MentionType; 5] = [
        MentionType::Per,
        MentionType::Org,
        MentionType::Gpe,
        MentionType::Title,
        MentionType::Date,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Per => "PER",
            Self::Org => "ORG",
            Self::Gpe => "GPE",
            Self::Title => "TITLE",
            Self::Date => "DATE",
        }
    }

    /// Entity types can be relation subjects and carry links
    pub fn is_entity(&self) -> bool {
        matches!(self, Self::Per | Self::Org | Self::Gpe)
    }

    /// Lowercase prefix used to select among inverse labels
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Per => "per",
            Self::Org => "org",
            Self::Gpe => "gpe",
            Self::Title => "title",
            Self::Date => "date",
        }
    }

    /// Map a CoreNLP-style NER tag onto a mention type
    pub fn from_ner_tag(tag: &str) -> Option<Self> {
        match tag {
            "PERSON" | "PER" => Some(Self::Per),
            "ORGANIZATION" | "ORG" => Some(Self::Org),
            "GPE" | "CITY" | "STATE_OR_PROVINCE" | "COUNTRY" | "LOCATION" => Some(Self::Gpe),
            "TITLE" => Some(Self::Title),
            "DATE" => Some(Self::Date),
            _ => None,
        }
    }
}

impl fmt::Display for MentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MentionType {
    type Err = KbpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PER" => Ok(Self::Per),
            "ORG" => Ok(Self::Org),
            "GPE" => Ok(Self::Gpe),
            "TITLE" => Ok(Self::Title),
            "DATE" => Ok(Self::Date),
            other => Err(KbpoError::Validation(format!("unknown mention type: {other}"))),
        }
    }
}

// ============================================================================
// Relation Labels
// ============================================================================

/// Relation labels accepted by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RelationLabel {
    PerPlaceOfBirth,
    PerPlaceOfResidence,
    PerPlaceOfDeath,
    PerDateOfBirth,
    PerDateOfDeath,
    PerOrganizationsFounded,
    PerHoldsSharesIn,
    PerSchoolsAttended,
    PerEmployeeOrMemberOf,
    PerParents,
    PerChildren,
    PerSpouse,
    PerSiblings,
    PerOtherFamily,
    PerTitle,
    OrgPlaceOfHeadquarters,
    OrgDateFounded,
    OrgDateDissolved,
    OrgFoundedBy,
    OrgMemberOf,
    OrgMembers,
    OrgSubsidiaries,
    OrgParents,
    OrgShareholders,
    OrgHoldsSharesIn,
    OrgEmployeesOrMembers,
    OrgStudents,
    OrgOrganizationsFounded,
    GpeBirthsInPlace,
    GpeResidentsInPlace,
    GpeDeathsInPlace,
    GpeEmployeesOrMembers,
    GpeHoldsSharesIn,
    GpeOrganizationsFounded,
    GpeMemberOf,
    GpeHeadquartersInPlace,
    NoRelation,
}

use MentionType::{Date, Gpe, Org, Per, Title};
use RelationLabel::*;

impl RelationLabel {
    /// The canonical labels, in presentation order
    pub const CANONICAL: [RelationLabel; 27] = [
        PerPlaceOfBirth,
        PerPlaceOfResidence,
        PerPlaceOfDeath,
        PerDateOfBirth,
        PerDateOfDeath,
        PerOrganizationsFounded,
        PerHoldsSharesIn,
        PerSchoolsAttended,
        PerEmployeeOrMemberOf,
        PerParents,
        PerChildren,
        PerSpouse,
        PerSiblings,
        PerOtherFamily,
        PerTitle,
        OrgPlaceOfHeadquarters,
        OrgDateFounded,
        OrgDateDissolved,
        OrgFoundedBy,
        OrgMemberOf,
        OrgMembers,
        OrgSubsidiaries,
        OrgParents,
        OrgShareholders,
        OrgHoldsSharesIn,
        OrgEmployeesOrMembers,
        OrgStudents,
    ];

    /// Labels that only occur as inverses of canonical labels
    pub const INVERSE_ONLY: [RelationLabel; 9] = [
        OrgOrganizationsFounded,
        GpeBirthsInPlace,
        GpeResidentsInPlace,
        GpeDeathsInPlace,
        GpeEmployeesOrMembers,
        GpeHoldsSharesIn,
        GpeOrganizationsFounded,
        GpeMemberOf,
        GpeHeadquartersInPlace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PerPlaceOfBirth => "per:place_of_birth",
            PerPlaceOfResidence => "per:place_of_residence",
            PerPlaceOfDeath => "per:place_of_death",
            PerDateOfBirth => "per:date_of_birth",
            PerDateOfDeath => "per:date_of_death",
            PerOrganizationsFounded => "per:organizations_founded",
            PerHoldsSharesIn => "per:holds_shares_in",
            PerSchoolsAttended => "per:schools_attended",
            PerEmployeeOrMemberOf => "per:employee_or_member_of",
            PerParents => "per:parents",
            PerChildren => "per:children",
            PerSpouse => "per:spouse",
            PerSiblings => "per:siblings",
            PerOtherFamily => "per:other_family",
            PerTitle => "per:title",
            OrgPlaceOfHeadquarters => "org:place_of_headquarters",
            OrgDateFounded => "org:date_founded",
            OrgDateDissolved => "org:date_dissolved",
            OrgFoundedBy => "org:founded_by",
            OrgMemberOf => "org:member_of",
            OrgMembers => "org:members",
            OrgSubsidiaries => "org:subsidiaries",
            OrgParents => "org:parents",
            OrgShareholders => "org:shareholders",
            OrgHoldsSharesIn => "org:holds_shares_in",
            OrgEmployeesOrMembers => "org:employees_or_members",
            OrgStudents => "org:students",
            OrgOrganizationsFounded => "org:organizations_founded",
            GpeBirthsInPlace => "gpe:births_in_place",
            GpeResidentsInPlace => "gpe:residents_in_place",
            GpeDeathsInPlace => "gpe:deaths_in_place",
            GpeEmployeesOrMembers => "gpe:employees_or_members",
            GpeHoldsSharesIn => "gpe:holds_shares_in",
            GpeOrganizationsFounded => "gpe:organizations_founded",
            GpeMemberOf => "gpe:member_of",
            GpeHeadquartersInPlace => "gpe:headquarters_in_place",
            NoRelation => "no_relation",
        }
    }

    /// Resolve a label, folding historical aliases into their canonical form
    pub fn from_alias(s: &str) -> Option<Self> {
        let label = match s.trim() {
            "per:city_of_birth" | "per:stateorprovince_of_birth" | "per:country_of_birth" => {
                PerPlaceOfBirth
            }
            "per:cities_of_residence"
            | "per:stateorprovinces_of_residence"
            | "per:countries_of_residence" => PerPlaceOfResidence,
            "per:city_of_death" | "per:stateorprovince_of_death" | "per:country_of_death" => {
                PerPlaceOfDeath
            }
            "per:top_member_employee_of" => PerEmployeeOrMemberOf,
            "org:city_of_headquarters"
            | "org:stateorprovince_of_headquarters"
            | "org:country_of_headquarters" => OrgPlaceOfHeadquarters,
            "org:top_members_employees" => OrgEmployeesOrMembers,
            "gpe:births_in_city" | "gpe:births_in_stateorprovince" | "gpe:births_in_country" => {
                GpeBirthsInPlace
            }
            "gpe:residents_of_city"
            | "gpe:residents_of_stateorprovince"
            | "gpe:residents_of_country" => GpeResidentsInPlace,
            "gpe:deaths_in_city" | "gpe:deaths_in_stateorprovince" | "gpe:deaths_in_country" => {
                GpeDeathsInPlace
            }
            "gpe:headquarters_in_city"
            | "gpe:headquarters_in_stateorprovince"
            | "gpe:headquarters_in_country" => GpeHeadquartersInPlace,
            other => return Self::all().find(|l| l.as_str() == other),
        };
        Some(label)
    }

    /// Every known label
    pub fn all() -> impl Iterator<Item = RelationLabel> {
        Self::CANONICAL
            .into_iter()
            .chain(Self::INVERSE_ONLY)
            .chain(std::iter::once(NoRelation))
    }

    pub fn is_canonical(&self) -> bool {
        Self::CANONICAL.contains(self)
    }

    pub fn is_no_relation(&self) -> bool {
        matches!(self, NoRelation)
    }

    /// Prefix naming the subject's type family (`per`, `org`, `gpe`)
    pub fn prefix(&self) -> &'static str {
        self.as_str().split(':').next().unwrap_or("")
    }

    /// Candidate inverse labels; the object's type selects among them
    pub fn inverses(&self) -> &'static [RelationLabel] {
        match self {
            PerChildren => &[PerParents],
            PerOtherFamily => &[PerOtherFamily],
            PerParents => &[PerChildren],
            PerSiblings => &[PerSiblings],
            PerSpouse => &[PerSpouse],
            PerEmployeeOrMemberOf => &[OrgEmployeesOrMembers, GpeEmployeesOrMembers],
            PerSchoolsAttended => &[OrgStudents],
            PerPlaceOfBirth => &[GpeBirthsInPlace],
            PerPlaceOfResidence => &[GpeResidentsInPlace],
            PerPlaceOfDeath => &[GpeDeathsInPlace],
            PerOrganizationsFounded => &[OrgFoundedBy],
            PerHoldsSharesIn => &[OrgShareholders],
            OrgShareholders => &[PerHoldsSharesIn, OrgHoldsSharesIn, GpeHoldsSharesIn],
            OrgHoldsSharesIn => &[OrgShareholders],
            OrgFoundedBy => &[
                PerOrganizationsFounded,
                OrgOrganizationsFounded,
                GpeOrganizationsFounded,
            ],
            OrgOrganizationsFounded => &[OrgFoundedBy],
            OrgEmployeesOrMembers => &[PerEmployeeOrMemberOf],
            OrgMemberOf => &[OrgMembers],
            OrgMembers => &[GpeMemberOf, OrgMemberOf],
            OrgStudents => &[PerSchoolsAttended],
            OrgSubsidiaries => &[OrgParents],
            OrgParents => &[OrgSubsidiaries],
            OrgPlaceOfHeadquarters => &[GpeHeadquartersInPlace],
            GpeBirthsInPlace => &[PerPlaceOfBirth],
            GpeResidentsInPlace => &[PerPlaceOfResidence],
            GpeDeathsInPlace => &[PerPlaceOfDeath],
            GpeEmployeesOrMembers => &[PerEmployeeOrMemberOf],
            GpeHoldsSharesIn => &[OrgShareholders],
            GpeOrganizationsFounded => &[OrgFoundedBy],
            GpeMemberOf => &[OrgMembers],
            GpeHeadquartersInPlace => &[OrgPlaceOfHeadquarters],
            _ => &[],
        }
    }

    pub fn has_inverse(&self) -> bool {
        !self.inverses().is_empty()
    }

    /// Inverse label whose subject family matches `object_type`
    pub fn inverse_for(&self, object_type: MentionType) -> Option<RelationLabel> {
        self.inverses()
            .iter()
            .copied()
            .find(|r| r.prefix() == object_type.prefix())
    }

    /// Admissible `(subject type, object types)`
    pub fn argument_types(&self) -> (MentionType, &'static [MentionType]) {
        match self {
            PerPlaceOfBirth | PerPlaceOfResidence | PerPlaceOfDeath => (Per, &[Gpe]),
            PerDateOfBirth | PerDateOfDeath => (Per, &[Date]),
            PerOrganizationsFounded | PerHoldsSharesIn | PerSchoolsAttended => (Per, &[Org]),
            PerEmployeeOrMemberOf => (Per, &[Org, Gpe]),
            PerParents | PerChildren | PerSpouse | PerSiblings | PerOtherFamily => (Per, &[Per]),
            PerTitle => (Per, &[Title]),
            OrgPlaceOfHeadquarters => (Org, &[Gpe]),
            OrgDateFounded | OrgDateDissolved => (Org, &[Date]),
            OrgFoundedBy | OrgShareholders => (Org, &[Per, Org, Gpe]),
            OrgMemberOf | OrgSubsidiaries | OrgParents | OrgHoldsSharesIn => (Org, &[Org]),
            OrgOrganizationsFounded => (Org, &[Org]),
            OrgMembers => (Org, &[Org, Gpe]),
            OrgEmployeesOrMembers | OrgStudents => (Org, &[Per]),
            GpeBirthsInPlace | GpeResidentsInPlace | GpeDeathsInPlace | GpeEmployeesOrMembers => {
                (Gpe, &[Per])
            }
            GpeHoldsSharesIn | GpeOrganizationsFounded | GpeMemberOf | GpeHeadquartersInPlace => {
                (Gpe, &[Org])
            }
            // Annotators may answer no_relation for any entity pair
            NoRelation => (Per, &[Per, Org, Gpe, Title, Date]),
        }
    }

    /// True if `(subject, object)` types are admissible for this label
    pub fn accepts(&self, subject: MentionType, object: MentionType) -> bool {
        if self.is_no_relation() {
            return subject.is_entity();
        }
        let (s, objects) = self.argument_types();
        s == subject && objects.contains(&object)
    }

    /// Object type of a string-valued relation (dates and titles)
    pub fn string_valued(&self) -> Option<MentionType> {
        let (_, objects) = self.argument_types();
        match objects {
            [Date] => Some(Date),
            [Title] => Some(Title),
            _ => None,
        }
    }
}

impl fmt::Display for RelationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationLabel {
    type Err = KbpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s)
            .ok_or_else(|| KbpoError::Validation(format!("unsupported relation: {s}")))
    }
}

impl TryFrom<String> for RelationLabel {
    type Error = KbpoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelationLabel> for String {
    fn from(label: RelationLabel) -> Self {
        label.as_str().to_string()
    }
}

/// Valid `(subject, object)` mention type pairs for relation questions.
///
/// Follows the PER > ORG > GPE preference: a pair is listed once, in the
/// direction whose subject ranks higher.
pub fn valid_mention_type_pairs() -> Vec<(MentionType, MentionType)> {
    let mut pairs = Vec::new();
    for label in RelationLabel::CANONICAL {
        let (subject, objects) = label.argument_types();
        for &object in objects {
            let excluded = matches!((subject, object), (Org, Per) | (Gpe, Org) | (Gpe, Per));
            if !excluded && !pairs.contains(&(subject, object)) {
                pairs.push((subject, object));
            }
        }
    }
    pairs.sort();
    pairs
}
